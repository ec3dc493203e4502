use crate::event::MediaEvent;
use crate::packet::{DataPacket, MediaKind};
use crate::pipeline::{Handler, HandlerContext};
use crate::stream_info::MediaStream;
use crate::worker::TaskHandle;
use bytes::BytesMut;
use log::{debug, warn};
use rtcp::header::{FORMAT_PLI, PacketType};
use rtcp::payload_feedbacks::full_intra_request::{FirEntry, FullIntraRequest};
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use shared::error::Result;
use shared::marshal::{Marshal, Unmarshal};
use std::time::{Duration, Instant};

pub const PLI_PACER_HANDLER_NAME: &str = "pli-pacer";
pub const DEFAULT_PLI_PERIOD: Duration = Duration::from_millis(200);
pub const DEFAULT_KEYFRAME_TIMEOUT: Duration = Duration::from_secs(4);

const RESEND_PLI: u64 = 1;

pub struct PliPacerHandlerBuilder {
    pli_period: Duration,
    keyframe_timeout: Duration,
}

impl Default for PliPacerHandlerBuilder {
    fn default() -> Self {
        Self {
            pli_period: DEFAULT_PLI_PERIOD,
            keyframe_timeout: DEFAULT_KEYFRAME_TIMEOUT,
        }
    }
}

impl PliPacerHandlerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pli_period(mut self, pli_period: Duration) -> Self {
        self.pli_period = pli_period;
        self
    }

    pub fn with_keyframe_timeout(mut self, keyframe_timeout: Duration) -> Self {
        self.keyframe_timeout = keyframe_timeout;
        self
    }

    pub fn build(self) -> PliPacerHandler {
        PliPacerHandler {
            enabled: true,
            pli_period: self.pli_period,
            keyframe_timeout: self.keyframe_timeout,
            waiting_since: None,
            resend: None,
            sender_ssrc: 0,
            media_ssrc: None,
            fir_sequence_number: 0,
        }
    }
}

/// Keeps at most one keyframe request in flight toward the sender.
///
/// The first outbound PLI is forwarded and repeated every `pli_period` until
/// a keyframe shows up on the inbound path. PLIs written in between are
/// absorbed. When no keyframe arrives within `keyframe_timeout` a FIR is sent
/// and the pacer goes idle.
pub struct PliPacerHandler {
    enabled: bool,
    pli_period: Duration,
    keyframe_timeout: Duration,

    waiting_since: Option<Instant>,
    resend: Option<TaskHandle>,

    sender_ssrc: u32,
    media_ssrc: Option<u32>,
    fir_sequence_number: u8,
}

impl Default for PliPacerHandler {
    fn default() -> Self {
        PliPacerHandlerBuilder::new().build()
    }
}

impl PliPacerHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_waiting_for_keyframe(&self) -> bool {
        self.waiting_since.is_some()
    }

    fn stop(&mut self, ctx: &mut HandlerContext<'_>) {
        self.waiting_since = None;
        if let Some(resend) = self.resend.take() {
            ctx.cancel(resend);
        }
    }

    fn send_pli(&self, ctx: &mut HandlerContext<'_>, media_ssrc: u32) -> Result<()> {
        let pli = PictureLossIndication {
            sender_ssrc: self.sender_ssrc,
            media_ssrc,
        };
        ctx.fire_write(DataPacket::rtcp(
            ctx.now(),
            MediaKind::Video,
            BytesMut::from(&pli.marshal()?[..]),
        ));
        Ok(())
    }

    fn send_fir(&mut self, ctx: &mut HandlerContext<'_>, media_ssrc: u32) -> Result<()> {
        let fir = FullIntraRequest {
            sender_ssrc: self.sender_ssrc,
            media_ssrc,
            fir: vec![FirEntry {
                ssrc: media_ssrc,
                sequence_number: self.fir_sequence_number,
            }],
        };
        self.fir_sequence_number = self.fir_sequence_number.wrapping_add(1);
        ctx.fire_write(DataPacket::rtcp(
            ctx.now(),
            MediaKind::Video,
            BytesMut::from(&fir.marshal()?[..]),
        ));
        ctx.fire_event(MediaEvent::KeyframeRequestEscalated { ssrc: media_ssrc });
        Ok(())
    }
}

/// Media SSRC of the first PLI in a compound, if any.
fn pli_media_ssrc(packet: &DataPacket) -> Option<u32> {
    if !packet.is_rtcp() {
        return None;
    }
    rtcp::packet::blocks(&packet.data)
        .filter(|(header, _)| {
            header.packet_type == PacketType::PayloadSpecificFeedback && header.count == FORMAT_PLI
        })
        .find_map(|(_, mut block)| PictureLossIndication::unmarshal(&mut block).ok())
        .map(|pli| pli.media_ssrc)
}

impl Handler for PliPacerHandler {
    fn name(&self) -> &'static str {
        PLI_PACER_HANDLER_NAME
    }

    fn notify_update(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
        if let Some(stream) = ctx.get_service::<MediaStream>() {
            self.sender_ssrc = stream.video_sink_ssrc.unwrap_or_default();
            self.media_ssrc = stream.video_source_ssrc(0);
        }
        Ok(())
    }

    fn detach(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
        self.stop(ctx);
        Ok(())
    }

    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn handle_read(&mut self, ctx: &mut HandlerContext<'_>, packet: DataPacket) -> Result<()> {
        if self.enabled && packet.is_keyframe && self.is_waiting_for_keyframe() {
            debug!("keyframe received, PLI resend stopped");
            self.stop(ctx);
        }
        ctx.fire_read(packet);
        Ok(())
    }

    fn handle_write(&mut self, ctx: &mut HandlerContext<'_>, packet: DataPacket) -> Result<()> {
        if self.enabled {
            if let Some(media_ssrc) = pli_media_ssrc(&packet) {
                if self.is_waiting_for_keyframe() {
                    debug!("PLI for {} discarded, waiting for keyframe", media_ssrc);
                    return Ok(());
                }
                self.media_ssrc = Some(media_ssrc);
                self.waiting_since = Some(packet.now);
                self.resend = Some(ctx.schedule_every(self.pli_period, RESEND_PLI));
            }
        }
        ctx.fire_write(packet);
        Ok(())
    }

    fn handle_timeout(&mut self, ctx: &mut HandlerContext<'_>, token: u64) -> Result<()> {
        if token != RESEND_PLI {
            return Ok(());
        }
        let (Some(waiting_since), Some(media_ssrc)) = (self.waiting_since, self.media_ssrc) else {
            self.stop(ctx);
            return Ok(());
        };

        if ctx.now().saturating_duration_since(waiting_since) >= self.keyframe_timeout {
            warn!("timed out waiting for a keyframe from {}", media_ssrc);
            self.stop(ctx);
            return self.send_fir(ctx, media_ssrc);
        }
        self.send_pli(ctx, media_ssrc)
    }
}
