use crate::packet::MediaKind;

/// Events surfaced by handlers for consumers outside the pipeline, and
/// broadcast into it through `handle_event`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// Fraction of packets lost (8-bit fixed point) in the latest receiver report.
    FractionLost {
        ssrc: u32,
        kind: MediaKind,
        fraction_lost: u8,
    },
    /// The forwarded layer changed.
    LayerSwitched {
        ssrc: u32,
        spatial_layer: u8,
        temporal_layer: u8,
    },
    /// No keyframe arrived after repeated PLIs; a FIR was sent instead.
    KeyframeRequestEscalated { ssrc: u32 },
    /// The owning stream's SSRC configuration changed.
    StreamUpdated,
}
