use crate::chain::{DepositId, Withdrawal, WithdrawalExtractor};

use bitcoin::script::Instruction;
use bitcoin::{Address, BlockHash, Network, Script, ScriptBuf, Transaction};

/// Recognizes withdrawals laid out as `recipient, OP_RETURN <deposit id>, [change]`.
///
/// The deposit id is the only push of the single OP_RETURN output and must be 32 bytes.
/// The recipient is the one output that is neither the OP_RETURN nor change back to the
/// multisig.
#[derive(Debug, Clone)]
pub struct OpReturnWithdrawalExtractor {
	multisig_script: ScriptBuf,
	network: Network,
}

impl OpReturnWithdrawalExtractor {
	pub fn new(multisig_script: ScriptBuf, network: Network) -> Self {
		Self {
			multisig_script,
			network,
		}
	}

	fn deposit_id(script: &Script) -> Option<DepositId> {
		let mut instructions = script.instructions().skip(1);
		let push = match instructions.next()? {
			Ok(Instruction::PushBytes(bytes)) => bytes,
			_ => return None,
		};
		if instructions.next().is_some() {
			return None;
		}
		let bytes: [u8; 32] = push.as_bytes().try_into().ok()?;
		Some(DepositId(bytes))
	}
}

impl WithdrawalExtractor for OpReturnWithdrawalExtractor {
	fn extract_withdrawal(
		&self,
		transaction: &Transaction,
		block_hash: Option<BlockHash>,
		block_height: Option<u32>,
	) -> Option<Withdrawal> {
		let mut op_returns = transaction
			.output
			.iter()
			.filter(|output| output.script_pubkey.is_op_return());
		let deposit_id = Self::deposit_id(&op_returns.next()?.script_pubkey)?;
		if op_returns.next().is_some() {
			return None;
		}

		let mut recipients = transaction.output.iter().filter(|output| {
			!output.script_pubkey.is_op_return() && output.script_pubkey != self.multisig_script
		});
		let recipient = recipients.next()?;
		if recipients.next().is_some() {
			return None;
		}

		let target_address = Address::from_script(&recipient.script_pubkey, self.network)
			.map(|address| address.to_string())
			.unwrap_or_else(|_| recipient.script_pubkey.to_hex_string());

		Some(Withdrawal {
			deposit_id,
			amount: recipient.value,
			target_address,
			block_number: block_height,
			block_hash,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{TestFederation, p2pkh_script};
	use bitcoin::script::PushBytesBuf;
	use bitcoin::{Amount, TxOut};

	fn op_return(data: &[u8]) -> TxOut {
		let push = PushBytesBuf::try_from(data.to_vec()).unwrap();
		TxOut {
			value: Amount::ZERO,
			script_pubkey: ScriptBuf::new_op_return(push),
		}
	}

	#[test]
	fn extracts_deposit_and_recipient() {
		let federation = TestFederation::new();
		let extractor =
			OpReturnWithdrawalExtractor::new(federation.script_pubkey(), Network::Regtest);
		let tx = federation.transaction(
			vec![],
			vec![
				TxOut {
					value: Amount::from_sat(40_000),
					script_pubkey: p2pkh_script(7),
				},
				op_return(&[9u8; 32]),
				TxOut {
					value: Amount::from_sat(5_000),
					script_pubkey: federation.script_pubkey(),
				},
			],
		);

		let withdrawal = extractor.extract_withdrawal(&tx, None, None).unwrap();
		assert_eq!(withdrawal.deposit_id, DepositId([9u8; 32]));
		assert_eq!(withdrawal.amount, Amount::from_sat(40_000));
		assert!(withdrawal.block_number.is_none());
	}

	#[test]
	fn ignores_transactions_without_deposit_id() {
		let federation = TestFederation::new();
		let extractor =
			OpReturnWithdrawalExtractor::new(federation.script_pubkey(), Network::Regtest);
		let plain = federation.transaction(
			vec![],
			vec![TxOut {
				value: Amount::from_sat(40_000),
				script_pubkey: p2pkh_script(7),
			}],
		);
		let short_id = federation.transaction(
			vec![],
			vec![
				TxOut {
					value: Amount::from_sat(40_000),
					script_pubkey: p2pkh_script(7),
				},
				op_return(&[1, 2, 3]),
			],
		);

		assert!(extractor.extract_withdrawal(&plain, None, None).is_none());
		assert!(extractor.extract_withdrawal(&short_id, None, None).is_none());
	}
}
