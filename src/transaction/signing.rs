//! Partial signing of P2SH multisig inputs.
//!
//! Each member signs independently and the partial scriptSigs are merged later. A partial
//! scriptSig holds one slot per key of the redeem script, in script order:
//! `OP_0 <slot 1> ... <slot n> <redeem script>`, where an empty slot is an `OP_0`.
//! Dropping the empty slots once `m` signatures are present is left to whoever finalizes.

use crate::config::MultisigParams;

use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::OP_0;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{PublicKey, ScriptBuf, Transaction};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
	#[error("Input {0} does not exist")]
	InputOutOfRange(usize),

	#[error("Key is not part of the federation script")]
	NotAMember,

	#[error("Input {input} has a malformed multisig scriptSig")]
	MalformedScriptSig { input: usize },

	#[error("Input {input} carries an invalid signature")]
	InvalidSignature { input: usize },

	#[error("Script push too large: {0}")]
	Push(String),
}

fn sighash_message(
	tx: &Transaction,
	input: usize,
	redeem_script: &ScriptBuf,
) -> Result<Message, SigningError> {
	let sighash = SighashCache::new(tx)
		.legacy_signature_hash(input, redeem_script, EcdsaSighashType::All.to_u32())
		.map_err(|_| SigningError::InputOutOfRange(input))?;
	Ok(Message::from_digest(sighash.to_byte_array()))
}

/// Signature slots of an input, one per federation key. An input without a scriptSig has
/// only empty slots.
pub fn input_signatures(
	tx: &Transaction,
	input: usize,
	multisig: &MultisigParams,
) -> Result<Vec<Option<ecdsa::Signature>>, SigningError> {
	let txin = tx.input.get(input).ok_or(SigningError::InputOutOfRange(input))?;
	let key_count = multisig.public_keys().len();
	if txin.script_sig.is_empty() {
		return Ok(vec![None; key_count]);
	}

	let malformed = || SigningError::MalformedScriptSig { input };
	let pushes = txin
		.script_sig
		.instructions()
		.map(|instruction| match instruction {
			Ok(Instruction::PushBytes(bytes)) => Ok(bytes.as_bytes().to_vec()),
			_ => Err(malformed()),
		})
		.collect::<Result<Vec<_>, _>>()?;

	let [dummy, slots @ .., redeem] = &pushes[..] else {
		return Err(malformed());
	};
	if !dummy.is_empty()
		|| slots.len() != key_count
		|| redeem[..] != multisig.redeem_script().as_bytes()[..]
	{
		return Err(malformed());
	}

	slots
		.iter()
		.map(|slot| match slot.is_empty() {
			true => Ok(None),
			false => ecdsa::Signature::from_slice(slot)
				.map(Some)
				.map_err(|_| SigningError::InvalidSignature { input }),
		})
		.collect()
}

fn script_sig(
	multisig: &MultisigParams,
	slots: &[Option<ecdsa::Signature>],
) -> Result<ScriptBuf, SigningError> {
	let mut builder = Builder::new().push_opcode(OP_0);
	for slot in slots {
		builder = match slot {
			Some(signature) => builder.push_slice(
				PushBytesBuf::try_from(signature.to_vec())
					.map_err(|e| SigningError::Push(e.to_string()))?,
			),
			None => builder.push_opcode(OP_0),
		};
	}
	let redeem = PushBytesBuf::try_from(multisig.redeem_script().to_bytes())
		.map_err(|e| SigningError::Push(e.to_string()))?;
	Ok(builder.push_slice(redeem).into_script())
}

/// Add this member's signature to `input`, keeping signatures already present.
pub fn sign_input(
	tx: &mut Transaction,
	input: usize,
	multisig: &MultisigParams,
	secret: &SecretKey,
) -> Result<(), SigningError> {
	let secp = Secp256k1::new();
	let public_key = PublicKey::new(secret.public_key(&secp));
	let slot = multisig
		.public_keys()
		.iter()
		.position(|key| *key == public_key)
		.ok_or(SigningError::NotAMember)?;

	let message = sighash_message(tx, input, multisig.redeem_script())?;
	let signature = ecdsa::Signature {
		signature: secp.sign_ecdsa(&message, secret),
		sighash_type: EcdsaSighashType::All,
	};

	let mut slots = input_signatures(tx, input, multisig)?;
	slots[slot] = Some(signature);
	tx.input[input].script_sig = script_sig(multisig, &slots)?;
	Ok(())
}

/// Sign every input of `tx`.
pub fn sign_transaction(
	tx: &mut Transaction,
	multisig: &MultisigParams,
	secret: &SecretKey,
) -> Result<(), SigningError> {
	for input in 0..tx.input.len() {
		sign_input(tx, input, multisig, secret)?;
	}
	Ok(())
}

/// Number of valid signatures on `input`. Any signature that does not verify is an error.
pub fn verify_input_signatures(
	tx: &Transaction,
	input: usize,
	multisig: &MultisigParams,
) -> Result<usize, SigningError> {
	let slots = input_signatures(tx, input, multisig)?;
	if slots.iter().all(Option::is_none) {
		return Ok(0);
	}

	let secp = Secp256k1::verification_only();
	let message = sighash_message(tx, input, multisig.redeem_script())?;
	let mut valid = 0;
	for (slot, key) in slots.iter().zip(multisig.public_keys()) {
		let Some(signature) = slot else {
			continue;
		};
		if signature.sighash_type != EcdsaSighashType::All
			|| secp
				.verify_ecdsa(&message, &signature.signature, &key.inner)
				.is_err()
		{
			return Err(SigningError::InvalidSignature { input });
		}
		valid += 1;
	}
	Ok(valid)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{TestFederation, federation_keys, p2pkh_script, txid};
	use bitcoin::{Amount, OutPoint, TxOut};

	fn unsigned(federation: &TestFederation) -> Transaction {
		federation.transaction(
			vec![OutPoint::new(txid(1), 0), OutPoint::new(txid(2), 1)],
			vec![TxOut {
				value: Amount::from_sat(10_000),
				script_pubkey: p2pkh_script(9),
			}],
		)
	}

	fn secrets() -> Vec<SecretKey> {
		federation_keys().into_iter().map(|(secret, _)| secret).collect()
	}

	#[test]
	fn unsigned_input_has_empty_slots() {
		let federation = TestFederation::new();
		let tx = unsigned(&federation);

		let slots = input_signatures(&tx, 0, &federation.params()).unwrap();
		assert_eq!(slots, vec![None, None, None]);
		assert_eq!(verify_input_signatures(&tx, 0, &federation.params()).unwrap(), 0);
	}

	#[test]
	fn partial_signatures_merge_in_key_order() {
		let federation = TestFederation::new();
		let params = federation.params();
		let secrets = secrets();
		let mut tx = unsigned(&federation);

		sign_transaction(&mut tx, &params, &secrets[2]).unwrap();
		sign_transaction(&mut tx, &params, &secrets[0]).unwrap();

		for input in 0..tx.input.len() {
			let slots = input_signatures(&tx, input, &params).unwrap();
			assert!(slots[0].is_some());
			assert!(slots[1].is_none());
			assert!(slots[2].is_some());
			assert_eq!(verify_input_signatures(&tx, input, &params).unwrap(), 2);
		}
	}

	#[test]
	fn signing_twice_is_stable() {
		let federation = TestFederation::new();
		let params = federation.params();
		let secrets = secrets();
		let mut once = unsigned(&federation);
		sign_transaction(&mut once, &params, &secrets[0]).unwrap();
		let mut twice = once.clone();
		sign_transaction(&mut twice, &params, &secrets[0]).unwrap();

		assert_eq!(once, twice);
	}

	#[test]
	fn foreign_key_cannot_sign() {
		let federation = TestFederation::new();
		let mut tx = unsigned(&federation);
		let outsider = SecretKey::from_slice(&[42u8; 32]).unwrap();

		assert_eq!(
			sign_input(&mut tx, 0, &federation.params(), &outsider),
			Err(SigningError::NotAMember)
		);
	}

	#[test]
	fn signature_over_other_outputs_is_rejected() {
		let federation = TestFederation::new();
		let params = federation.params();
		let secrets = secrets();
		let mut tx = unsigned(&federation);
		sign_input(&mut tx, 0, &params, &secrets[1]).unwrap();

		tx.output[0].value = Amount::from_sat(20_000);
		assert_eq!(
			verify_input_signatures(&tx, 0, &params),
			Err(SigningError::InvalidSignature { input: 0 })
		);
	}

	#[test]
	fn missing_input_is_reported() {
		let federation = TestFederation::new();
		let tx = unsigned(&federation);
		assert_eq!(
			input_signatures(&tx, 5, &federation.params()),
			Err(SigningError::InputOutOfRange(5))
		);
	}
}
