use bitcoin::hashes::Hash;
use bitcoin::{Amount, FeeRate, OutPoint, TxOut, Txid};
use federation_ledger::chain::{DepositId, FixedFeePolicy};
use federation_ledger::testing::{TestFederation, TestWallet, p2pkh_script, settings};
use federation_ledger::transaction::signing::verify_input_signatures;
use federation_ledger::transaction::{
	PolicyError, Recipient, TransactionError, WithdrawalTransactionBuilder,
};
use federation_ledger::wallet::FederationWalletManager;
use federation_ledger::wallet::keys::secret_from_mnemonic;
use federation_ledger::FederationWalletSettings;
use std::sync::Arc;

const MNEMONIC: &str =
	"abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

struct Coins {
	/// Confirmed at height 10
	x: OutPoint,
	/// Outputs 0 and 1 of one transaction confirmed at height 12
	a0: OutPoint,
	a1: OutPoint,
}

/// Mine coins of 50k sats at heights 10, 12 and 12, applying every block to `others` too.
async fn fund(wallet: &TestWallet, others: &[&TestWallet]) -> Coins {
	let x = wallet.federation.deposit(50_000, 1);
	let a = wallet.federation.transaction(
		vec![OutPoint::new(Txid::from_byte_array([0xaa; 32]), 0)],
		vec![
			TxOut {
				value: Amount::from_sat(50_000),
				script_pubkey: wallet.federation.script_pubkey(),
			},
			TxOut {
				value: Amount::from_sat(50_000),
				script_pubkey: wallet.federation.script_pubkey(),
			},
		],
	);
	let coins = Coins {
		x: OutPoint::new(x.compute_txid(), 0),
		a0: OutPoint::new(a.compute_txid(), 0),
		a1: OutPoint::new(a.compute_txid(), 1),
	};

	for height in 1..=12 {
		let txs = match height {
			10 => vec![x.clone()],
			12 => vec![a.clone()],
			_ => Vec::new(),
		};
		let (block, header) = wallet.mine(txs);
		for manager in std::iter::once(wallet).chain(others.iter().copied()) {
			manager.manager.process_block(&block, &header).await.unwrap();
		}
	}
	coins
}

fn fee_policy() -> Arc<FixedFeePolicy> {
	Arc::new(FixedFeePolicy(FeeRate::from_sat_per_vb_u32(2)))
}

fn builder(manager: &Arc<FederationWalletManager>) -> WithdrawalTransactionBuilder {
	WithdrawalTransactionBuilder::new(manager.clone(), fee_policy())
}

fn pay(sats: u64) -> Vec<Recipient> {
	vec![Recipient::new(p2pkh_script(0x99), Amount::from_sat(sats))]
}

fn inputs(tx: &bitcoin::Transaction) -> Vec<OutPoint> {
	tx.input.iter().map(|input| input.previous_output).collect()
}

#[tokio::test]
async fn selects_oldest_coins_first_without_gaps() {
	let wallet = TestWallet::started().await;
	let coins = fund(&wallet, &[]).await;

	let built = builder(&wallet.manager)
		.with_recipients(pay(80_000))
		.build()
		.await
		.unwrap();

	assert_eq!(inputs(&built.transaction), vec![coins.x, coins.a0]);
	// 674 vbytes at 2 sat/vB
	assert_eq!(built.fee, Amount::from_sat(1_348));
	assert_eq!(built.change, Some(Amount::from_sat(18_652)));
	let outputs = &built.transaction.output;
	assert_eq!(outputs.len(), 2);
	assert_eq!(outputs[0].script_pubkey, p2pkh_script(0x99));
	assert_eq!(outputs[1].script_pubkey, wallet.federation.script_pubkey());
	assert_eq!(
		built.inputs.iter().map(|r| r.outpoint()).collect::<Vec<_>>(),
		vec![coins.x, coins.a0]
	);
}

#[tokio::test]
async fn members_build_identical_transactions() {
	let first = TestWallet::started().await;
	let second = first.sharing_chain(TestFederation::for_member(1));
	second.manager.start().await.unwrap();
	fund(&first, &[&second]).await;

	let build = |wallet: &TestWallet| {
		builder(&wallet.manager)
			.with_recipients(pay(120_000))
			.with_op_return(DepositId([5; 32]))
			.build()
	};
	let ours = build(&first).await.unwrap();
	let theirs = build(&second).await.unwrap();

	assert_eq!(ours.transaction, theirs.transaction);
	assert_eq!(ours.transaction.input.len(), 3);
}

#[tokio::test]
async fn small_fee_is_raised_to_minimum() {
	let wallet = TestWallet::started().await;
	let coins = fund(&wallet, &[]).await;

	let built = builder(&wallet.manager)
		.with_recipients(pay(10_000))
		.build()
		.await
		.unwrap();

	assert_eq!(inputs(&built.transaction), vec![coins.x]);
	assert_eq!(built.fee, wallet.manager.settings().min_tx_fee);

	let overridden = builder(&wallet.manager)
		.with_recipients(pay(10_000))
		.with_fee_override(Amount::from_sat(10))
		.build()
		.await
		.unwrap();
	assert_eq!(overridden.fee, wallet.manager.settings().min_tx_fee);
}

#[tokio::test]
async fn dust_change_goes_to_fee() {
	let wallet = TestWallet::started().await;
	fund(&wallet, &[]).await;

	let built = builder(&wallet.manager)
		.with_recipients(pay(48_800))
		.build()
		.await
		.unwrap();

	assert_eq!(built.change, None);
	assert_eq!(built.transaction.output.len(), 1);
	assert_eq!(built.fee, Amount::from_sat(1_200));
}

#[tokio::test]
async fn insufficient_funds_are_reported() {
	let wallet = TestWallet::started().await;
	fund(&wallet, &[]).await;

	let err = builder(&wallet.manager)
		.with_recipients(pay(1_000_000))
		.build()
		.await
		.unwrap_err();

	match err {
		TransactionError::InsufficientFunds {
			available,
			requested,
		} => {
			assert_eq!(available, Amount::from_sat(150_000));
			assert!(requested > Amount::from_sat(1_000_000));
		}
		other => panic!("unexpected error: {other}"),
	}
}

#[tokio::test]
async fn confirmation_threshold_limits_candidates() {
	let wallet = TestWallet::started().await;
	let coins = fund(&wallet, &[]).await;

	let built = builder(&wallet.manager)
		.with_recipients(pay(20_000))
		.with_min_confirmations(3)
		.build()
		.await
		.unwrap();
	assert_eq!(inputs(&built.transaction), vec![coins.x]);

	let err = builder(&wallet.manager)
		.with_recipients(pay(80_000))
		.with_min_confirmations(3)
		.build()
		.await
		.unwrap_err();
	assert!(matches!(
		err,
		TransactionError::InsufficientFunds { available, .. } if available == Amount::from_sat(50_000)
	));

	let err = builder(&wallet.manager)
		.with_recipients(pay(20_000))
		.with_min_confirmations(4)
		.build()
		.await
		.unwrap_err();
	assert!(matches!(err, TransactionError::NoSpendableCoins));
}

#[tokio::test]
async fn empty_wallet_has_no_spendable_coins() {
	let wallet = TestWallet::started().await;

	let err = builder(&wallet.manager)
		.with_recipients(pay(1_000))
		.build()
		.await
		.unwrap_err();

	assert!(matches!(err, TransactionError::NoSpendableCoins));
}

#[tokio::test]
async fn inactive_wallet_refuses_to_build() {
	let wallet = TestWallet::started_with(FederationWalletSettings {
		activation_height: 50,
		..settings()
	})
	.await;

	let err = builder(&wallet.manager)
		.with_recipients(pay(1_000))
		.build()
		.await
		.unwrap_err();

	assert!(matches!(err, TransactionError::Wallet(_)));
}

#[tokio::test]
async fn selected_inputs_come_first() {
	let wallet = TestWallet::started().await;
	let coins = fund(&wallet, &[]).await;

	let only = builder(&wallet.manager)
		.with_recipients(pay(30_000))
		.with_selected_inputs(vec![coins.a1])
		.allow_other_inputs(false)
		.build()
		.await
		.unwrap();
	assert_eq!(inputs(&only.transaction), vec![coins.a1]);

	let topped_up = builder(&wallet.manager)
		.with_recipients(pay(80_000))
		.with_selected_inputs(vec![coins.a1])
		.build()
		.await
		.unwrap();
	assert_eq!(inputs(&topped_up.transaction), vec![coins.a1, coins.x]);

	let err = builder(&wallet.manager)
		.with_recipients(pay(80_000))
		.with_selected_inputs(vec![coins.a1])
		.allow_other_inputs(false)
		.build()
		.await
		.unwrap_err();
	assert!(matches!(err, TransactionError::InsufficientFunds { .. }));
}

#[tokio::test]
async fn unknown_selected_input_is_rejected() {
	let wallet = TestWallet::started().await;
	let coins = fund(&wallet, &[]).await;
	let foreign = OutPoint::new(Txid::from_byte_array([0x01; 32]), 3);

	let err = builder(&wallet.manager)
		.with_recipients(pay(10_000))
		.with_selected_inputs(vec![foreign])
		.build()
		.await
		.unwrap_err();
	assert!(matches!(err, TransactionError::InvalidSelectedInputs(_)));

	let err = builder(&wallet.manager)
		.with_recipients(pay(10_000))
		.with_selected_inputs(vec![coins.x, coins.x])
		.build()
		.await
		.unwrap_err();
	assert!(matches!(err, TransactionError::InvalidSelectedInputs(_)));
}

#[tokio::test]
async fn policy_violations_fail_verification() {
	let wallet = TestWallet::started_with(FederationWalletSettings {
		absurd_fee: Amount::from_sat(4_000),
		..settings()
	})
	.await;
	fund(&wallet, &[]).await;

	let err = builder(&wallet.manager)
		.with_recipients(pay(100))
		.build()
		.await
		.unwrap_err();
	match err {
		TransactionError::VerificationFailed(errors) => assert_eq!(
			errors,
			vec![PolicyError::DustOutput {
				index: 0,
				amount: Amount::from_sat(100)
			}]
		),
		other => panic!("unexpected error: {other}"),
	}

	let err = builder(&wallet.manager)
		.with_recipients(pay(10_000))
		.with_fee_override(Amount::from_sat(5_000))
		.build()
		.await
		.unwrap_err();
	assert!(matches!(
		err,
		TransactionError::VerificationFailed(ref errors)
			if errors.contains(&PolicyError::AbsurdFee {
				fee: Amount::from_sat(5_000),
				maximum: Amount::from_sat(4_000),
			})
	));

	let unchecked = builder(&wallet.manager)
		.with_recipients(pay(100))
		.ignore_verify()
		.build()
		.await
		.unwrap();
	assert_eq!(unchecked.transaction.output[0].value, Amount::from_sat(100));
}

#[tokio::test]
async fn signed_withdrawal_carries_member_signature() {
	let secret = secret_from_mnemonic(MNEMONIC, "", bitcoin::Network::Regtest).unwrap();
	let wallet = TestWallet::for_federation(TestFederation::with_member_secret(secret), settings());
	wallet.manager.start().await.unwrap();
	fund(&wallet, &[]).await;

	let unsigned = builder(&wallet.manager)
		.with_recipients(pay(80_000))
		.sign(true)
		.build()
		.await
		.unwrap_err();
	assert!(matches!(unsigned, TransactionError::Wallet(_)));

	wallet
		.manager
		.enable_wallet("hunter2", Some(MNEMONIC), None)
		.await
		.unwrap();
	let built = builder(&wallet.manager)
		.with_recipients(pay(80_000))
		.with_password("hunter2")
		.sign(true)
		.build()
		.await
		.unwrap();

	let params = wallet.federation.params();
	for input in 0..built.transaction.input.len() {
		assert_eq!(
			verify_input_signatures(&built.transaction, input, &params).unwrap(),
			1
		);
	}
}

#[tokio::test]
async fn built_withdrawal_validates_once_processed() {
	let wallet = TestWallet::started().await;
	fund(&wallet, &[]).await;
	let deposit = DepositId([0x33; 32]);

	let built = builder(&wallet.manager)
		.with_recipients(pay(30_000))
		.with_op_return(deposit)
		.build()
		.await
		.unwrap();
	wallet
		.manager
		.process_transaction(&built.transaction, None, None, None)
		.await
		.unwrap();

	let validation = wallet
		.manager
		.validate_transaction(&built.transaction, false)
		.await
		.unwrap();
	assert!(validation.is_valid());
	let withdrawals = wallet
		.manager
		.find_withdrawal_transactions(Some(deposit))
		.await
		.unwrap();
	assert_eq!(withdrawals.len(), 1);
	assert_eq!(withdrawals[0].transaction_id, built.transaction.compute_txid());
	assert_eq!(withdrawals[0].withdrawal.amount, Amount::from_sat(30_000));
}

#[tokio::test]
async fn consolidation_spends_every_coin_into_change() {
	let wallet = TestWallet::started().await;
	fund(&wallet, &[]).await;

	let built = builder(&wallet.manager)
		.consolidation()
		.build()
		.await
		.unwrap();

	assert_eq!(built.transaction.input.len(), 3);
	assert_eq!(built.transaction.output.len(), 1);
	assert_eq!(
		built.transaction.output[0].script_pubkey,
		wallet.federation.script_pubkey()
	);
	assert_eq!(built.change, Some(Amount::from_sat(150_000) - built.fee));
	let validation = wallet
		.manager
		.validate_consolidating_transaction(&built.transaction, false)
		.await
		.unwrap();
	assert!(validation.is_valid());
}
