//! Size and fee estimation for federation transactions.

use crate::config::MultisigParams;

use bitcoin::consensus::encode::{VarInt, serialize};
use bitcoin::{Amount, FeeRate, TxOut};

/// Version and lock time.
const TX_OVERHEAD: u64 = 4 + 4;
/// Outpoint, sequence and a three byte scriptSig length prefix.
const INPUT_OVERHEAD: u64 = 36 + 4 + 3;
/// Push opcode plus the largest DER signature with its sighash byte.
const SIGNATURE_PUSH: u64 = 1 + 73;

/// Size of one fully signed P2SH multisig input.
pub fn multisig_input_vsize(multisig: &MultisigParams) -> u64 {
	let redeem_len = multisig.redeem_script().len() as u64;
	let redeem_push = redeem_len + if redeem_len < 76 { 1 } else { 2 };
	let signatures = multisig.threshold() as u64 * SIGNATURE_PUSH;
	let placeholders = (multisig.public_keys().len() - multisig.threshold()) as u64;

	INPUT_OVERHEAD + 1 + signatures + placeholders + redeem_push
}

pub fn output_vsize(output: &TxOut) -> u64 {
	serialize(output).len() as u64
}

/// Virtual size of a transaction spending `inputs` federation coins into `outputs`.
pub fn estimate_vsize(multisig: &MultisigParams, inputs: usize, outputs: &[TxOut]) -> u64 {
	let count_prefixes =
		VarInt(inputs as u64).size() as u64 + VarInt(outputs.len() as u64).size() as u64;
	TX_OVERHEAD
		+ count_prefixes
		+ inputs as u64 * multisig_input_vsize(multisig)
		+ outputs.iter().map(output_vsize).sum::<u64>()
}

/// Fee at `rate` for `vsize`, never below `min_fee`.
pub fn fee_for_vsize(rate: FeeRate, vsize: u64, min_fee: Amount) -> Amount {
	rate.fee_vb(vsize).unwrap_or(Amount::MAX_MONEY).max(min_fee)
}
