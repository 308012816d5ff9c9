//! Transaction model and wire codec.
//!
//! The txid is the SHA-256 of the unsigned serialization: the same layout
//! with every input's 72-byte signature slot omitted. Signing therefore
//! commits to all prev references and outputs but never to other signatures.

use emberd_consensus::{hash256_to_hex, Hash256};

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256;
use crate::keys::{PublicKeyBytes, PUBLIC_KEY_BYTES};

/// Wire size of a serialized input.
pub const INPUT_BYTES: usize = 108;
/// Wire size of a serialized output.
pub const OUTPUT_BYTES: usize = 73;
/// Wire size of the zero-padded signature slot inside an input.
pub const SIGNATURE_SLOT_BYTES: usize = 72;
/// Wire size of the two leading count fields.
pub const COUNTS_BYTES: usize = 8;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxInput {
    pub prev_txid: Hash256,
    /// Output index in the referenced transaction; carries the block height
    /// for a coinbase input.
    pub prev_index: u32,
    /// DER signature bytes, or the miner-chosen message for a coinbase.
    /// Stored unpadded; the codec pads to [`SIGNATURE_SLOT_BYTES`].
    pub signature: Vec<u8>,
}

impl TxInput {
    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.prev_txid);
        encoder.write_u32_be(self.prev_index);
        let mut slot = [0u8; SIGNATURE_SLOT_BYTES];
        let len = self.signature.len().min(SIGNATURE_SLOT_BYTES);
        slot[..len].copy_from_slice(&self.signature[..len]);
        encoder.write_bytes(&slot);
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let prev_txid = decoder.read_fixed::<32>()?;
        let prev_index = decoder.read_u32_be()?;
        let slot = decoder.read_fixed::<SIGNATURE_SLOT_BYTES>()?;
        Ok(Self {
            prev_txid,
            prev_index,
            signature: trim_signature_slot(&slot),
        })
    }
}

/// Effective content of a signature slot. Byte 1 of a DER signature declares
/// the remaining length, so `2 + slot[1]` bytes are meaningful (clamped to
/// the slot). A slot whose first byte is zero is all padding.
pub fn trim_signature_slot(slot: &[u8; SIGNATURE_SLOT_BYTES]) -> Vec<u8> {
    if slot[0] == 0 {
        return Vec::new();
    }
    let effective = (2 + slot[1] as usize).min(SIGNATURE_SLOT_BYTES);
    slot[..effective].to_vec()
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOutput {
    pub amount: u64,
    pub public_key: PublicKeyBytes,
}

impl TxOutput {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u64_be(self.amount);
        encoder.write_bytes(&self.public_key);
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let amount = decoder.read_u64_be()?;
        let public_key = decoder.read_fixed::<PUBLIC_KEY_BYTES>()?;
        Ok(Self { amount, public_key })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// The required coinbase shape: one synthetic input whose `prev_index`
    /// carries the block height and whose signature slot carries the
    /// miner-chosen message, and one output crediting the reward.
    pub fn coinbase(to: &PublicKeyBytes, reward: u64, height: u64, message: &[u8]) -> Self {
        let mut data = message.to_vec();
        data.truncate(SIGNATURE_SLOT_BYTES);
        Self {
            inputs: vec![TxInput {
                prev_txid: [0u8; 32],
                prev_index: height as u32,
                signature: data,
            }],
            outputs: vec![TxOutput {
                amount: reward,
                public_key: *to,
            }],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.bytes_length());
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u32_be(self.inputs.len() as u32);
        encoder.write_u32_be(self.outputs.len() as u32);
        for input in &self.inputs {
            input.encode_into(encoder);
        }
        for output in &self.outputs {
            output.encode_into(encoder);
        }
    }

    /// Serialization with every signature slot omitted; hashing this yields
    /// the txid.
    pub fn encode_unsigned(&self) -> Vec<u8> {
        let mut encoder =
            Encoder::with_capacity(COUNTS_BYTES + 36 * self.inputs.len() + OUTPUT_BYTES * self.outputs.len());
        encoder.write_u32_be(self.inputs.len() as u32);
        encoder.write_u32_be(self.outputs.len() as u32);
        for input in &self.inputs {
            encoder.write_bytes(&input.prev_txid);
            encoder.write_u32_be(input.prev_index);
        }
        for output in &self.outputs {
            output.encode_into(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn txid(&self) -> Hash256 {
        sha256(&self.encode_unsigned())
    }

    pub fn txid_hex(&self) -> String {
        hash256_to_hex(&self.txid())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let input_count = decoder.read_u32_be()? as usize;
        let output_count = decoder.read_u32_be()? as usize;
        let need = input_count
            .checked_mul(INPUT_BYTES)
            .and_then(|bytes| output_count.checked_mul(OUTPUT_BYTES).map(|out| bytes + out))
            .ok_or(DecodeError::Overflow)?;
        if decoder.remaining() < need {
            return Err(DecodeError::Overflow);
        }
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(TxInput::decode_from(decoder)?);
        }
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(TxOutput::decode_from(decoder)?);
        }
        Ok(Self { inputs, outputs })
    }

    /// Parses back-to-back transactions until the buffer is exhausted.
    pub fn decode_many(bytes: &[u8]) -> Result<Vec<Self>, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let mut txs = Vec::new();
        while !decoder.is_empty() {
            txs.push(Self::decode_from(&mut decoder)?);
        }
        Ok(txs)
    }

    pub fn output_value(&self) -> u64 {
        self.outputs.iter().map(|output| output.amount).sum()
    }

    pub fn bytes_length(&self) -> usize {
        COUNTS_BYTES + INPUT_BYTES * self.inputs.len() + OUTPUT_BYTES * self.outputs.len()
    }

    /// Miner-chosen coinbase message with the slot padding stripped.
    pub fn coinbase_message(&self) -> Vec<u8> {
        let Some(input) = self.inputs.first() else {
            return Vec::new();
        };
        let mut data = input.signature.clone();
        while data.last() == Some(&0) {
            data.pop();
        }
        data
    }
}
