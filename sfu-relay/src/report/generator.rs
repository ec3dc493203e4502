use crate::packet::MediaKind;
use log::trace;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtp::sequence::is_newer_sequence_number;
use std::time::{Duration, Instant};

pub const DEFAULT_VIDEO_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_AUDIO_INTERVAL: Duration = Duration::from_millis(5000);

const SEQ_MOD: u64 = 1 << 16;
const MAX_TOTAL_LOST: i64 = 0xFFFFFF;

#[derive(Default)]
pub struct ReceiverReportGeneratorBuilder {
    sender_ssrc: Option<u32>,
    interval: Option<Duration>,
    clock_rate: Option<u32>,
}

impl ReceiverReportGeneratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// SSRC written as the report's sender. Random when unset.
    pub fn with_sender_ssrc(mut self, sender_ssrc: u32) -> Self {
        self.sender_ssrc = Some(sender_ssrc);
        self
    }

    /// Average report interval. Defaults depend on the media kind.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_clock_rate(mut self, clock_rate: u32) -> Self {
        self.clock_rate = Some(clock_rate);
        self
    }

    pub fn build(self, media_ssrc: u32, kind: MediaKind) -> ReceiverReportGenerator {
        let interval = self.interval.unwrap_or(match kind {
            MediaKind::Audio => DEFAULT_AUDIO_INTERVAL,
            _ => DEFAULT_VIDEO_INTERVAL,
        });
        let clock_rate = self
            .clock_rate
            .filter(|rate| *rate > 0)
            .unwrap_or_else(|| kind.default_clock_rate());

        ReceiverReportGenerator {
            sender_ssrc: self.sender_ssrc.unwrap_or_else(rand::random::<u32>),
            media_ssrc,
            kind,
            clock_rate: clock_rate as f64,
            interval,
            started: false,
            base_seq: 0,
            max_seq: 0,
            cycles: 0,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            jitter: 0.0,
            last_rtp_time: 0,
            last_arrival: None,
            last_sender_report: 0,
            last_sender_report_time: None,
            next_report: None,
            fraction_lost: 0,
        }
    }
}

/// Reception statistics for one remote SSRC and the pacing of its reports.
pub struct ReceiverReportGenerator {
    sender_ssrc: u32,
    media_ssrc: u32,
    kind: MediaKind,
    clock_rate: f64,
    interval: Duration,

    started: bool,
    base_seq: u16,
    max_seq: u16,
    /// Count of sequence number wraps, shifted by 16.
    cycles: u64,
    received: u64,
    expected_prior: u64,
    received_prior: u64,
    jitter: f64,
    last_rtp_time: u32,
    last_arrival: Option<Instant>,

    /// Middle 32 bits of the last SR's NTP timestamp.
    last_sender_report: u32,
    last_sender_report_time: Option<Instant>,

    next_report: Option<Instant>,
    fraction_lost: u8,
}

impl ReceiverReportGenerator {
    pub fn new(media_ssrc: u32, kind: MediaKind) -> Self {
        ReceiverReportGeneratorBuilder::new().build(media_ssrc, kind)
    }

    pub fn media_ssrc(&self) -> u32 {
        self.media_ssrc
    }

    pub fn sender_ssrc(&self) -> u32 {
        self.sender_ssrc
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// When the next report is due, once the first packet has been seen.
    pub fn next_report(&self) -> Option<Instant> {
        self.next_report
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_report.is_some_and(|next| now >= next)
    }

    /// Fraction lost carried by the most recent report, in 1/256 units.
    pub fn fraction_lost(&self) -> u8 {
        self.fraction_lost
    }

    pub fn jitter(&self) -> u32 {
        self.jitter as u32
    }

    fn extended_max(&self) -> u64 {
        self.cycles + self.max_seq as u64
    }

    fn expected(&self) -> u64 {
        (self.extended_max() + 1).saturating_sub(self.base_seq as u64)
    }

    /// Accounts one received media packet and reports whether a report is due.
    pub fn handle_rtp_packet(
        &mut self,
        now: Instant,
        sequence_number: u16,
        timestamp: u32,
    ) -> bool {
        if !self.started {
            self.started = true;
            self.base_seq = sequence_number;
            self.max_seq = sequence_number;
            self.received = 1;
            self.last_rtp_time = timestamp;
            self.last_arrival = Some(now);
            self.next_report = Some(now + self.interval);
            return false;
        }

        if is_newer_sequence_number(sequence_number, self.max_seq) {
            if sequence_number < self.max_seq {
                self.cycles += SEQ_MOD;
            }
            self.max_seq = sequence_number;
        }
        self.received += 1;

        if let Some(last_arrival) = self.last_arrival {
            // https://tools.ietf.org/html/rfc3550#appendix-A.8
            let arrival =
                now.saturating_duration_since(last_arrival).as_secs_f64() * self.clock_rate;
            let sent = timestamp.wrapping_sub(self.last_rtp_time) as i32 as f64;
            let d = arrival - sent;
            self.jitter += (d.abs() - self.jitter) / 16.0;
        }
        self.last_rtp_time = timestamp;
        self.last_arrival = Some(now);

        self.is_due(now)
    }

    pub fn handle_sender_report(&mut self, now: Instant, sr: &SenderReport) {
        self.last_sender_report = sr.compact_ntp_time();
        self.last_sender_report_time = Some(now);
    }

    /// Builds a report from the statistics gathered so far and schedules the next one.
    pub fn generate_report(&mut self, now: Instant) -> ReceiverReport {
        let expected = self.expected();
        let total_lost = (expected as i64 - self.received as i64).clamp(0, MAX_TOTAL_LOST);

        let expected_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = self.received.saturating_sub(self.received_prior);
        let lost_interval = expected_interval as i64 - received_interval as i64;
        self.expected_prior = expected;
        self.received_prior = self.received;

        self.fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval as i64).min(255) as u8
        };

        let delay = self
            .last_sender_report_time
            .map(|sr_time| (now.saturating_duration_since(sr_time).as_secs_f64() * 65536.0) as u32)
            .unwrap_or(0);

        let factor = rand::random_range(0.5..1.5);
        self.next_report = Some(now + self.interval.mul_f64(factor));
        trace!(
            "ssrc {} report: expected {} lost {} fraction {}",
            self.media_ssrc, expected, total_lost, self.fraction_lost
        );

        ReceiverReport {
            ssrc: self.sender_ssrc,
            reports: vec![ReceptionReport {
                ssrc: self.media_ssrc,
                fraction_lost: self.fraction_lost,
                total_lost: total_lost as u32,
                last_sequence_number: self.extended_max() as u32,
                jitter: self.jitter as u32,
                last_sender_report: self.last_sender_report,
                delay,
            }],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(generator: &mut ReceiverReportGenerator, now: Instant, seqs: &[u16]) {
        for &seq in seqs {
            generator.handle_rtp_packet(now, seq, seq as u32 * 3000);
        }
    }

    #[test]
    fn test_builder_defaults() {
        let video = ReceiverReportGenerator::new(1, MediaKind::Video);
        assert_eq!(video.interval, DEFAULT_VIDEO_INTERVAL);
        assert_eq!(video.clock_rate, 90000.0);

        let audio = ReceiverReportGeneratorBuilder::new()
            .with_sender_ssrc(7)
            .build(2, MediaKind::Audio);
        assert_eq!(audio.interval, DEFAULT_AUDIO_INTERVAL);
        assert_eq!(audio.clock_rate, 48000.0);
        assert_eq!(audio.sender_ssrc(), 7);
    }

    #[test]
    fn test_first_packet_schedules_report() {
        let now = Instant::now();
        let mut generator = ReceiverReportGenerator::new(1, MediaKind::Video);
        assert!(generator.next_report().is_none());
        assert!(!generator.handle_rtp_packet(now, 10, 0));
        assert_eq!(generator.next_report(), Some(now + DEFAULT_VIDEO_INTERVAL));

        let before = now + Duration::from_millis(999);
        assert!(!generator.handle_rtp_packet(before, 11, 90000));
        let due = now + Duration::from_millis(1000);
        assert!(generator.handle_rtp_packet(due, 12, 90000));
    }

    #[test]
    fn test_report_counts_losses() {
        let now = Instant::now();
        let mut generator = ReceiverReportGeneratorBuilder::new()
            .with_sender_ssrc(99)
            .build(1234, MediaKind::Video);
        feed(&mut generator, now, &[1, 2, 3, 5, 6, 7, 8]);

        let rr = generator.generate_report(now);
        assert_eq!(rr.ssrc, 99);
        assert_eq!(rr.reports.len(), 1);
        let report = &rr.reports[0];
        assert_eq!(report.ssrc, 1234);
        assert_eq!(report.total_lost, 1);
        assert_eq!(report.last_sequence_number, 8);
        // 1 of 8 lost
        assert_eq!(report.fraction_lost, 32);
        assert_eq!(generator.fraction_lost(), 32);

        // nothing lost in the next interval, cumulative count stays
        feed(&mut generator, now, &[9, 10, 11, 12]);
        let report = generator.generate_report(now).reports[0];
        assert_eq!(report.total_lost, 1);
        assert_eq!(report.fraction_lost, 0);
    }

    #[test]
    fn test_late_packet_reduces_loss() {
        let now = Instant::now();
        let mut generator = ReceiverReportGenerator::new(1, MediaKind::Video);
        feed(&mut generator, now, &[1, 2, 4, 3]);
        let report = generator.generate_report(now).reports[0];
        assert_eq!(report.total_lost, 0);
        assert_eq!(report.last_sequence_number, 4);
    }

    #[test]
    fn test_wraparound_extends_sequence() {
        let now = Instant::now();
        let mut generator = ReceiverReportGenerator::new(1, MediaKind::Video);
        feed(&mut generator, now, &[65534, 65535, 0, 1]);
        let report = generator.generate_report(now).reports[0];
        assert_eq!(report.last_sequence_number, (1 << 16) | 1);
        assert_eq!(report.total_lost, 0);
    }

    #[test]
    fn test_report_reschedules_with_jitter() {
        let now = Instant::now();
        let mut generator = ReceiverReportGenerator::new(1, MediaKind::Video);
        feed(&mut generator, now, &[1, 2]);
        generator.generate_report(now);
        let next = generator.next_report().unwrap();
        assert!(next >= now + Duration::from_millis(500));
        assert!(next <= now + Duration::from_millis(1500));
    }

    #[test]
    fn test_delay_since_last_sender_report() {
        let now = Instant::now();
        let mut generator = ReceiverReportGenerator::new(1, MediaKind::Audio);
        feed(&mut generator, now, &[1]);

        let sr = SenderReport {
            ssrc: 1,
            ntp_time: 0x1122_3344_5566_7788,
            ..Default::default()
        };
        generator.handle_sender_report(now, &sr);

        let report = generator.generate_report(now + Duration::from_millis(500)).reports[0];
        assert_eq!(report.last_sender_report, 0x3344_5566);
        assert_eq!(report.delay, 32768);
    }

    #[test]
    fn test_jitter_stays_zero_for_paced_packets() {
        let now = Instant::now();
        let mut generator = ReceiverReportGenerator::new(1, MediaKind::Video);
        for i in 0..10u16 {
            let arrival = now + Duration::from_millis(i as u64 * 100);
            generator.handle_rtp_packet(arrival, i, i as u32 * 9000);
        }
        assert_eq!(generator.jitter(), 0);
    }
}
