use crate::packet::MediaKind;

/// RTCP feedback mechanism negotiated for the stream.
///
/// See: <https://draft.ortc.org/#dom-rtcrtcpfeedback>
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RTCPFeedback {
    /// Type of feedback mechanism: "ack", "ccm", "nack", "goog-remb", "transport-cc".
    pub typ: String,

    /// For example, `typ="nack"` with `parameter="pli"` enables Picture Loss Indication.
    pub parameter: String,
}

impl RTCPFeedback {
    pub fn new(typ: &str, parameter: &str) -> Self {
        Self {
            typ: typ.to_owned(),
            parameter: parameter.to_owned(),
        }
    }
}

/// The stream a pipeline belongs to, registered as a pipeline service.
///
/// Knows which SSRCs arrive from the sender (sources, one per simulcast
/// spatial layer for video) and which SSRCs the receiver expects (sinks).
#[derive(Default, Debug, Clone)]
pub struct MediaStream {
    pub id: String,
    /// Indexed by spatial layer.
    pub video_source_ssrcs: Vec<u32>,
    pub audio_source_ssrc: Option<u32>,
    pub video_sink_ssrc: Option<u32>,
    pub audio_sink_ssrc: Option<u32>,
    /// Zero means the default for the kind.
    pub video_clock_rate: u32,
    pub audio_clock_rate: u32,
    pub rtcp_feedback: Vec<RTCPFeedback>,
}

impl MediaStream {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            ..Default::default()
        }
    }

    pub fn is_video_source_ssrc(&self, ssrc: u32) -> bool {
        self.video_source_ssrcs.contains(&ssrc)
    }

    pub fn is_audio_source_ssrc(&self, ssrc: u32) -> bool {
        self.audio_source_ssrc == Some(ssrc)
    }

    pub fn is_source_ssrc(&self, ssrc: u32) -> bool {
        self.is_video_source_ssrc(ssrc) || self.is_audio_source_ssrc(ssrc)
    }

    pub fn is_sink_ssrc(&self, ssrc: u32) -> bool {
        self.video_sink_ssrc == Some(ssrc) || self.audio_sink_ssrc == Some(ssrc)
    }

    pub fn video_source_ssrc(&self, spatial_layer: u8) -> Option<u32> {
        self.video_source_ssrcs.get(spatial_layer as usize).copied()
    }

    pub fn kind_of(&self, ssrc: u32) -> MediaKind {
        if self.is_video_source_ssrc(ssrc) || self.video_sink_ssrc == Some(ssrc) {
            MediaKind::Video
        } else if self.is_audio_source_ssrc(ssrc) || self.audio_sink_ssrc == Some(ssrc) {
            MediaKind::Audio
        } else {
            MediaKind::Other
        }
    }

    pub fn clock_rate(&self, kind: MediaKind) -> u32 {
        let configured = match kind {
            MediaKind::Video => self.video_clock_rate,
            MediaKind::Audio => self.audio_clock_rate,
            MediaKind::Other => 0,
        };
        if configured > 0 {
            configured
        } else {
            kind.default_clock_rate()
        }
    }

    /// Generic NACK (`nack` with no parameter) was negotiated.
    pub fn supports_nack(&self) -> bool {
        self.rtcp_feedback
            .iter()
            .any(|fb| fb.typ == "nack" && fb.parameter.is_empty())
    }

    pub fn supports_pli(&self) -> bool {
        self.rtcp_feedback
            .iter()
            .any(|fb| fb.typ == "nack" && fb.parameter == "pli")
    }
}
