//! Solidity bindings shared by the runtime.
//!
//! Uses alloy's `sol!` macro so venue call parameters and emitted events carry
//! their canonical ABI encodings.

use alloy::sol;

sol! {
    interface ISwapRouter {
        struct ExactOutputSingleParams {
            address tokenIn;
            address tokenOut;
            uint24 fee;
            address recipient;
            uint256 deadline;
            uint256 amountOut;
            uint256 amountInMaximum;
            uint160 sqrtPriceLimitX96;
        }
        function exactOutputSingle(ExactOutputSingleParams calldata params) external payable returns (uint256 amountIn);
    }

    /// Emitted by the processor once an interaction reaches a terminal state.
    event InteractionProcessed(
        uint32 indexed bridgeId,
        uint256 indexed nonce,
        uint256 totalInputValue,
        address outputAssetA,
        address outputAssetB,
        uint256 outputValueA,
        uint256 outputValueB,
        bool result
    );

    /// Emitted by the processor when a bridge defers its outputs.
    event AsyncInteractionStarted(uint32 indexed bridgeId, uint256 indexed nonce, uint256 totalInputValue);

    /// Emitted by the lending bridge when an underlying is bound to its share token.
    event UnderlyingRegistered(address indexed underlying, address wrappedShare);
}
