//! Interaction lifecycle of the processor: validation, failure unwinding,
//! asynchronous completion and explicit failure, plus a swap through the
//! Uniswap bridge.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use bridge_runtime::contracts::{AsyncInteractionStarted, InteractionProcessed};
use bridge_runtime::sandbox::{InMemoryLedger, SandboxSwapRouter};
use bridge_runtime::{
    AssetDescriptor, AssetKey, BridgeAdapter, BridgeError, BridgeOutputs, ConvertArgs,
    ConvertOutcome, ConvertRequest, EventLog, FinaliseRequest, InteractionStatus, Processor,
    TokenMetadata, UniswapBridge,
};

const PROCESSOR: Address = Address::repeat_byte(0xa1);
const DEPOSITOR: Address = Address::repeat_byte(0x0d);
const DAI: Address = Address::repeat_byte(0xda);
const USDC: Address = Address::repeat_byte(0xcc);
const WETH: Address = Address::repeat_byte(0xee);
const ROUTER: Address = Address::repeat_byte(0x77);
const ELSEWHERE: Address = Address::repeat_byte(0xff);

// ── Test bridges ─────────────────────────────────────────────────────────────

/// Always fails. When `steal` is set it first moves the escrow away.
struct Failing {
    address: Address,
    ledger: Arc<InMemoryLedger>,
    steal: bool,
}

#[async_trait]
impl BridgeAdapter for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn address(&self) -> Address {
        self.address
    }

    async fn convert(&self, request: ConvertRequest) -> Result<ConvertOutcome, BridgeError> {
        if self.steal {
            let token = request.input_asset_a.contract.unwrap_or(DAI);
            self.ledger
                .move_tokens(token, self.address, ELSEWHERE, request.input_amount)?;
        }
        Err(BridgeError::ExternalVenueFailure {
            venue: "test".into(),
            message: "venue offline".into(),
        })
    }
}

/// Defers its output until `ready` is set, then pays USDC one-to-one.
struct Deferred {
    address: Address,
    ledger: Arc<InMemoryLedger>,
    ready: AtomicBool,
}

#[async_trait]
impl BridgeAdapter for Deferred {
    fn name(&self) -> &str {
        "deferred"
    }

    fn address(&self) -> Address {
        self.address
    }

    async fn convert(&self, _request: ConvertRequest) -> Result<ConvertOutcome, BridgeError> {
        Ok(ConvertOutcome::pending())
    }

    async fn finalise(
        &self,
        request: FinaliseRequest,
    ) -> Result<Option<BridgeOutputs>, BridgeError> {
        if !self.ready.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let amount = U256::from(request.interaction_nonce) * U256::from(100u64);
        self.ledger.faucet(USDC, self.address, amount)?;
        self.ledger.set_allowance(USDC, self.address, PROCESSOR, amount)?;
        Ok(Some(BridgeOutputs {
            output_value_a: amount,
            output_value_b: U256::ZERO,
        }))
    }
}

/// Pays out native currency for any input.
struct NativePayout {
    address: Address,
    ledger: Arc<InMemoryLedger>,
    honest: bool,
}

#[async_trait]
impl BridgeAdapter for NativePayout {
    fn name(&self) -> &str {
        "native_payout"
    }

    fn address(&self) -> Address {
        self.address
    }

    async fn convert(&self, request: ConvertRequest) -> Result<ConvertOutcome, BridgeError> {
        if self.honest {
            self.ledger.faucet_native(self.address, request.input_amount)?;
            self.ledger
                .move_native(self.address, PROCESSOR, request.input_amount)?;
        }
        Ok(ConvertOutcome::sync(request.input_amount, U256::ZERO))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn dai() -> AssetDescriptor {
    AssetDescriptor::fungible(1, DAI)
}

fn usdc() -> AssetDescriptor {
    AssetDescriptor::fungible(2, USDC)
}

fn weth() -> AssetDescriptor {
    AssetDescriptor::fungible(3, WETH)
}

async fn setup() -> (Arc<InMemoryLedger>, Processor) {
    let ledger = Arc::new(InMemoryLedger::new());
    for (token, symbol) in [(DAI, "DAI"), (USDC, "USDC")] {
        ledger
            .register_token(token, TokenMetadata::new(symbol, symbol, 18))
            .unwrap();
    }
    ledger.faucet(DAI, DEPOSITOR, U256::from(1_000u64)).unwrap();
    let processor = Processor::new(PROCESSOR, ledger.clone(), Arc::new(EventLog::new()));
    processor
        .fund(&dai(), DEPOSITOR, U256::from(1_000u64))
        .await
        .unwrap();
    (ledger, processor)
}

async fn with_deferred(processor: &Processor, ledger: &Arc<InMemoryLedger>) -> Arc<Deferred> {
    let bridge = Arc::new(Deferred {
        address: Address::repeat_byte(0xb3),
        ledger: ledger.clone(),
        ready: AtomicBool::new(false),
    });
    processor.register_bridge(3, bridge.clone()).await.unwrap();
    bridge
}

// ── Validation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unknown_bridge() {
    let (_ledger, processor) = setup().await;
    let err = processor
        .convert(ConvertArgs::new(9, dai(), usdc(), U256::from(1u64), 1))
        .await
        .unwrap_err();
    assert_eq!(err, BridgeError::UnknownBridge(9));
    assert_eq!(processor.pooled_balance(&dai()).await, U256::from(1_000u64));
}

#[tokio::test]
async fn test_insufficient_pooled_balance() {
    let (ledger, processor) = setup().await;
    with_deferred(&processor, &ledger).await;
    let err = processor
        .convert(ConvertArgs::new(3, dai(), usdc(), U256::from(1_001u64), 1))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BridgeError::InsufficientBalance {
            have: U256::from(1_000u64),
            need: U256::from(1_001u64),
        }
    );
    assert!(processor.interaction(1).await.is_none());
}

#[tokio::test]
async fn test_duplicate_nonce() {
    let (ledger, processor) = setup().await;
    with_deferred(&processor, &ledger).await;
    processor
        .convert(ConvertArgs::new(3, dai(), usdc(), U256::from(10u64), 1))
        .await
        .unwrap();
    let err = processor
        .convert(ConvertArgs::new(3, dai(), usdc(), U256::from(10u64), 1))
        .await
        .unwrap_err();
    assert_eq!(err, BridgeError::DuplicateNonce(1));
    assert_eq!(processor.pooled_balance(&dai()).await, U256::from(990u64));
}

#[tokio::test]
async fn test_output_a_must_be_used() {
    let (ledger, processor) = setup().await;
    let bridge = Arc::new(NativePayout {
        address: Address::repeat_byte(0xb4),
        ledger: ledger.clone(),
        honest: true,
    });
    processor.register_bridge(4, bridge).await.unwrap();
    let err = processor
        .convert(ConvertArgs::new(4, dai(), AssetDescriptor::none(), U256::from(5u64), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidInput(_)));
}

// ── Failure unwinding ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_failing_bridge_leaves_balances_unchanged() {
    let (ledger, processor) = setup().await;
    let address = Address::repeat_byte(0xb1);
    processor
        .register_bridge(
            1,
            Arc::new(Failing {
                address,
                ledger: ledger.clone(),
                steal: false,
            }),
        )
        .await
        .unwrap();

    let before = processor.pooled_balances().await;
    let err = processor
        .convert(ConvertArgs::new(1, dai(), usdc(), U256::from(300u64), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ExternalVenueFailure { .. }));
    assert!(err.is_retryable());

    assert_eq!(processor.pooled_balances().await, before);
    assert_eq!(ledger.balance(DAI, PROCESSOR).unwrap(), U256::from(1_000u64));
    assert!(ledger.balance(DAI, address).unwrap().is_zero());
    assert!(processor.interaction(1).await.is_none());

    let processed = processor.events().decoded::<InteractionProcessed>();
    assert_eq!(processed.len(), 1);
    assert!(!processed[0].result);
}

#[tokio::test]
async fn test_lost_escrow_marks_interaction_failed() {
    let (ledger, processor) = setup().await;
    processor
        .register_bridge(
            1,
            Arc::new(Failing {
                address: Address::repeat_byte(0xb1),
                ledger: ledger.clone(),
                steal: true,
            }),
        )
        .await
        .unwrap();

    let err = processor
        .convert(ConvertArgs::new(1, dai(), usdc(), U256::from(300u64), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ExternalVenueFailure { .. }));
    assert_eq!(
        processor.interaction(1).await.unwrap().status,
        InteractionStatus::Failed
    );
    // the debit stands, nothing was credited
    assert_eq!(processor.pooled_balance(&dai()).await, U256::from(700u64));
    assert!(processor.pooled_balance(&usdc()).await.is_zero());
    assert_eq!(
        processor.finalise(1).await.unwrap_err(),
        BridgeError::AlreadyFinalised(1)
    );
}

#[tokio::test]
async fn test_native_output_must_arrive() {
    let (ledger, processor) = setup().await;
    processor
        .register_bridge(
            5,
            Arc::new(NativePayout {
                address: Address::repeat_byte(0xb5),
                ledger: ledger.clone(),
                honest: true,
            }),
        )
        .await
        .unwrap();
    processor
        .register_bridge(
            6,
            Arc::new(NativePayout {
                address: Address::repeat_byte(0xb6),
                ledger: ledger.clone(),
                honest: false,
            }),
        )
        .await
        .unwrap();

    let native = AssetDescriptor::native(0);
    processor
        .convert(ConvertArgs::new(5, dai(), native, U256::from(50u64), 1))
        .await
        .unwrap();
    assert_eq!(processor.pooled_balance(&native).await, U256::from(50u64));
    assert_eq!(ledger.native_of(PROCESSOR), U256::from(50u64));

    let err = processor
        .convert(ConvertArgs::new(6, dai(), native, U256::from(50u64), 2))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvariantViolation(_)));
    assert_eq!(processor.pooled_balance(&native).await, U256::from(50u64));
    assert_eq!(processor.pooled_balance(&dai()).await, U256::from(950u64));
}

// ── Asynchronous interactions ────────────────────────────────────────────────

#[tokio::test]
async fn test_async_lifecycle() {
    let (ledger, processor) = setup().await;
    let bridge = with_deferred(&processor, &ledger).await;

    let result = processor
        .convert(ConvertArgs::new(3, dai(), usdc(), U256::from(200u64), 4))
        .await
        .unwrap();
    assert!(result.is_async);
    assert!(result.output_value_a.is_zero());
    assert_eq!(processor.pending_nonces().await, vec![4]);
    assert_eq!(processor.pooled_balance(&dai()).await, U256::from(800u64));
    assert_eq!(
        processor.events().decoded::<AsyncInteractionStarted>()[0].nonce,
        U256::from(4u64)
    );

    assert_eq!(
        processor.finalise(4).await.unwrap_err(),
        BridgeError::AsyncNotReady(4)
    );
    assert_eq!(processor.pending_nonces().await, vec![4]);

    bridge.ready.store(true, Ordering::SeqCst);
    let result = processor.finalise(4).await.unwrap();
    assert_eq!(result.output_value_a, U256::from(400u64));
    assert_eq!(processor.pooled_balance(&usdc()).await, U256::from(400u64));
    assert_eq!(ledger.balance(USDC, PROCESSOR).unwrap(), U256::from(400u64));
    assert!(processor.pending_nonces().await.is_empty());

    assert_eq!(
        processor.finalise(4).await.unwrap_err(),
        BridgeError::AlreadyFinalised(4)
    );
    assert_eq!(processor.pooled_balance(&usdc()).await, U256::from(400u64));
    assert_eq!(
        processor.finalise(99).await.unwrap_err(),
        BridgeError::UnknownNonce(99)
    );
}

#[tokio::test]
async fn test_concurrent_finalise_completes_once() {
    let (ledger, processor) = setup().await;
    let bridge = with_deferred(&processor, &ledger).await;
    processor
        .convert(ConvertArgs::new(3, dai(), usdc(), U256::from(10u64), 1))
        .await
        .unwrap();
    bridge.ready.store(true, Ordering::SeqCst);

    let processor = Arc::new(processor);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let processor = processor.clone();
            tokio::spawn(async move { processor.finalise(1).await })
        })
        .collect();
    let mut completed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => completed += 1,
            Err(e) => assert_eq!(e, BridgeError::AlreadyFinalised(1)),
        }
    }
    assert_eq!(completed, 1);
    assert_eq!(processor.pooled_balance(&usdc()).await, U256::from(100u64));
}

#[tokio::test]
async fn test_fail_interaction_refunds_input() {
    let (ledger, processor) = setup().await;
    let bridge = with_deferred(&processor, &ledger).await;
    processor
        .convert(ConvertArgs::new(3, dai(), usdc(), U256::from(250u64), 2))
        .await
        .unwrap();
    assert_eq!(ledger.balance(DAI, bridge.address()).unwrap(), U256::from(250u64));

    processor.fail_interaction(2).await.unwrap();
    assert_eq!(processor.pooled_balance(&dai()).await, U256::from(1_000u64));
    assert_eq!(ledger.balance(DAI, PROCESSOR).unwrap(), U256::from(1_000u64));
    assert_eq!(
        processor.interaction(2).await.unwrap().status,
        InteractionStatus::Failed
    );
    assert_eq!(
        processor.fail_interaction(2).await.unwrap_err(),
        BridgeError::AlreadyFinalised(2)
    );
    assert_eq!(
        processor.finalise(2).await.unwrap_err(),
        BridgeError::AlreadyFinalised(2)
    );
}

#[tokio::test]
async fn test_sync_bridge_cannot_be_finalised() {
    let (ledger, processor) = setup().await;
    let bridge = Arc::new(NativePayout {
        address: Address::repeat_byte(0xb7),
        ledger: ledger.clone(),
        honest: true,
    });
    processor.register_bridge(7, bridge).await.unwrap();
    processor
        .convert(ConvertArgs::new(7, dai(), AssetDescriptor::native(0), U256::from(1u64), 1))
        .await
        .unwrap();
    assert_eq!(
        processor.finalise(1).await.unwrap_err(),
        BridgeError::AlreadyFinalised(1)
    );
}

// ── Swaps ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_native_swap_through_uniswap_bridge() {
    let (ledger, processor) = setup().await;
    let router = Arc::new(SandboxSwapRouter::new(ROUTER, WETH, ledger.clone()).unwrap());
    router
        .set_price(WETH, DAI, U256::from(1u64), U256::from(2_000u64))
        .unwrap();
    ledger.faucet(DAI, ROUTER, U256::from(1_000_000u64)).unwrap();
    let bridge_address = Address::repeat_byte(0xb2);
    let bridge = UniswapBridge::new(
        bridge_address,
        PROCESSOR,
        ledger.clone(),
        router,
        [DAI, USDC, WETH],
    );
    processor.register_bridge(2, Arc::new(bridge)).await.unwrap();

    ledger.faucet_native(DEPOSITOR, U256::from(5u64)).unwrap();
    let native = AssetDescriptor::native(0);
    processor
        .fund(&native, DEPOSITOR, U256::from(5u64))
        .await
        .unwrap();

    // buy exactly 6000 DAI with at most 5 ETH
    let result = processor
        .convert(
            ConvertArgs::new(2, native, dai(), U256::from(5u64), 1)
                .with_aux_data(U256::from(6_000u64)),
        )
        .await
        .unwrap();
    assert_eq!(result.output_value_a, U256::from(6_000u64));
    assert!(processor.pooled_balance(&native).await.is_zero());
    assert_eq!(processor.pooled_balance(&dai()).await, U256::from(7_000u64));
    // 2 WETH unspent stay with the bridge
    assert_eq!(ledger.balance(WETH, bridge_address).unwrap(), U256::from(2u64));

    // wrapping into WETH needs no swap
    ledger.faucet_native(DEPOSITOR, U256::from(3u64)).unwrap();
    processor
        .fund(&native, DEPOSITOR, U256::from(3u64))
        .await
        .unwrap();
    let result = processor
        .convert(
            ConvertArgs::new(2, native, weth(), U256::from(3u64), 2)
                .with_aux_data(U256::from(1u64)),
        )
        .await
        .unwrap();
    assert_eq!(result.output_value_a, U256::from(3u64));
    let balances = processor.pooled_balances().await;
    assert_eq!(balances.get(&AssetKey::Token(WETH)), Some(&U256::from(3u64)));
}

#[tokio::test]
async fn test_swap_slippage_restores_pool() {
    let (ledger, processor) = setup().await;
    let router = Arc::new(SandboxSwapRouter::new(ROUTER, WETH, ledger.clone()).unwrap());
    router
        .set_price(DAI, USDC, U256::from(1u64), U256::from(1u64))
        .unwrap();
    ledger.faucet(USDC, ROUTER, U256::from(1_000u64)).unwrap();
    let bridge = UniswapBridge::new(
        Address::repeat_byte(0xb2),
        PROCESSOR,
        ledger.clone(),
        router,
        [USDC],
    );
    processor.register_bridge(2, Arc::new(bridge)).await.unwrap();

    let err = processor
        .convert(
            ConvertArgs::new(2, dai(), usdc(), U256::from(100u64), 1)
                .with_aux_data(U256::from(150u64)),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BridgeError::SlippageExceeded {
            maximum: U256::from(100u64),
            required: U256::from(150u64),
        }
    );
    assert_eq!(processor.pooled_balance(&dai()).await, U256::from(1_000u64));

    // opt in to getting the unspent input back as output B
    let result = processor
        .convert(
            ConvertArgs::new(2, dai(), usdc(), U256::from(100u64), 1)
                .with_aux_data(U256::from(60u64))
                .with_output_b(dai()),
        )
        .await
        .unwrap();
    assert_eq!(result.output_value_a, U256::from(60u64));
    assert_eq!(result.output_value_b, U256::from(40u64));
    assert_eq!(processor.pooled_balance(&dai()).await, U256::from(940u64));
    assert_eq!(processor.pooled_balance(&usdc()).await, U256::from(60u64));
}
