//! Built-in pipeline stages.

mod feedback;
mod layer_filter;
mod padding;
mod pli_pacer;
mod retransmission;
mod stats;

pub use feedback::{
    FEEDBACK_GENERATION_HANDLER_NAME, FeedbackGenerationHandler, FeedbackGenerationHandlerBuilder,
};
pub use layer_filter::{
    DEFAULT_SWITCH_TIMEOUT, LAYER_FILTER_HANDLER_NAME, LayerFilterHandler,
    LayerFilterHandlerBuilder,
};
pub use padding::{
    DEFAULT_PADDING_PACKETS, PADDING_GENERATOR_HANDLER_NAME, PaddingGeneratorHandler,
    PaddingGeneratorHandlerBuilder,
};
pub use pli_pacer::{
    DEFAULT_KEYFRAME_TIMEOUT, DEFAULT_PLI_PERIOD, PLI_PACER_HANDLER_NAME, PliPacerHandler,
    PliPacerHandlerBuilder,
};
pub use retransmission::{
    DEFAULT_RETRANSMISSION_BUFFER_SIZE, RTP_RETRANSMISSION_HANDLER_NAME, RtpRetransmissionHandler,
    RtpRetransmissionHandlerBuilder,
};
pub use stats::{STATS_HANDLER_NAME, StatsHandler};

use crate::translator::{SequenceNumberKind, SequenceNumberTranslator};
use rtcp::transport_feedbacks::transport_layer_nack::{
    TransportLayerNack, nack_pairs_from_sequence_numbers,
};
use shared::error::Result;
use shared::marshal::Unmarshal;

/// Rewrites a receiver's NACK block from output to input numbering.
///
/// Outputs with no recoverable input (skipped, discarded, generated) are
/// left out; `None` means nothing was left to request.
pub(crate) fn translate_nack(
    translator: &SequenceNumberTranslator,
    mut block: &[u8],
    media_ssrc: Option<u32>,
) -> Result<Option<TransportLayerNack>> {
    let nack = TransportLayerNack::unmarshal(&mut block)?;
    let inputs: Vec<u16> = nack
        .nacks
        .iter()
        .flat_map(|pair| pair.packet_list())
        .filter_map(|output| {
            let sequence = translator.reverse(output);
            (sequence.kind == SequenceNumberKind::Valid).then_some(sequence.input)
        })
        .collect();
    if inputs.is_empty() {
        return Ok(None);
    }
    Ok(Some(TransportLayerNack {
        sender_ssrc: nack.sender_ssrc,
        media_ssrc: media_ssrc.unwrap_or(nack.media_ssrc),
        nacks: nack_pairs_from_sequence_numbers(&inputs),
    }))
}
