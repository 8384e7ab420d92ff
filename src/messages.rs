//! Construction of Template Distribution wire messages from a block
//! template.
//!
//! The shapes on the wire are the `template_distribution_sv2` structs; this
//! module only knows how to fill them from the node's view of a candidate
//! block.

use std::convert::TryInto;

use binary_sv2::{Seq0255, Seq064K, B016M, U256};
use roles_logic_sv2::template_distribution_sv2::{
    NewTemplate, RequestTransactionDataError, RequestTransactionDataSuccess, SetNewPrevHash,
};
use stratum_common::bitcoin::{consensus::encode::serialize, hashes::Hash, Block};

use crate::{error::TpResult, mining::BlockTemplate, TemplateId};

/// Builds the 0x71 `NewTemplate` message.
///
/// Only the witness commitment output travels in `coinbase_tx_outputs`; the
/// remaining reward is reported through `coinbase_tx_value_remaining` and
/// spent by outputs the client appends itself.
pub(crate) fn new_template(
    template: &dyn BlockTemplate,
    template_id: TemplateId,
    future_template: bool,
) -> TpResult<NewTemplate<'static>> {
    let header = template.block_header();
    let coinbase_tx = template.coinbase_tx();

    let coinbase_prefix = coinbase_tx.input[0].script_sig.to_bytes().try_into()?;
    let coinbase_tx_value_remaining = coinbase_tx.output.iter().map(|output| output.value).sum();
    let (coinbase_tx_outputs_count, coinbase_tx_outputs) = match template.witness_commitment_index()
    {
        Some(index) => (1u32, serialize(&coinbase_tx.output[index])),
        None => (0, Vec::new()),
    };

    let mut merkle_path = Vec::new();
    for node in template.coinbase_merkle_path() {
        let node: U256 = node.into_inner().to_vec().try_into()?;
        merkle_path.push(node);
    }

    Ok(NewTemplate {
        template_id,
        future_template,
        version: header.version as u32,
        coinbase_tx_version: coinbase_tx.version as u32,
        coinbase_prefix,
        coinbase_tx_input_sequence: coinbase_tx.input[0].sequence.0,
        coinbase_tx_value_remaining,
        coinbase_tx_outputs_count,
        coinbase_tx_outputs: coinbase_tx_outputs.try_into()?,
        coinbase_tx_locktime: coinbase_tx.lock_time.0,
        merkle_path: Seq0255::new(merkle_path)?,
    })
}

/// Builds the 0x72 `SetNewPrevHash` message announcing the template's tip.
pub(crate) fn set_new_prev_hash(
    template: &dyn BlockTemplate,
    template_id: TemplateId,
) -> TpResult<SetNewPrevHash<'static>> {
    let header = template.block_header();
    // The header target is derived from nBits; the wire wants it little-endian.
    let mut target = header.target().to_be_bytes();
    target.reverse();

    Ok(SetNewPrevHash {
        template_id,
        prev_hash: header.prev_blockhash.into_inner().to_vec().try_into()?,
        header_timestamp: header.time,
        n_bits: header.bits,
        target: target.to_vec().try_into()?,
    })
}

/// Builds the 0x74 `RequestTransactionData.Success` message.
///
/// `excess_data` carries the witness reserve value: stack element 0 of the
/// coinbase scriptWitness, or nothing for a coinbase without witness. The
/// transaction list excludes the coinbase.
pub(crate) fn request_transaction_data_success(
    block: &Block,
    template_id: TemplateId,
) -> TpResult<RequestTransactionDataSuccess<'static>> {
    let coinbase = &block.txdata[0];
    let witness_reserve_value = coinbase.input[0]
        .witness
        .to_vec()
        .first()
        .cloned()
        .unwrap_or_default();

    let mut transaction_list = Vec::new();
    for tx in block.txdata.iter().skip(1) {
        let tx: B016M = serialize(tx).try_into()?;
        transaction_list.push(tx);
    }

    Ok(RequestTransactionDataSuccess {
        template_id,
        excess_data: witness_reserve_value.try_into()?,
        transaction_list: Seq064K::new(transaction_list)?,
    })
}

/// Builds the 0x75 `RequestTransactionData.Error` message.
pub(crate) fn request_transaction_data_error(
    template_id: TemplateId,
    error_code: &str,
) -> TpResult<RequestTransactionDataError<'static>> {
    Ok(RequestTransactionDataError {
        template_id,
        error_code: error_code.to_string().try_into()?,
    })
}
