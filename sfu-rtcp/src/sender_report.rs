use crate::header::*;
use crate::packet::Packet;
use crate::reception_report::*;
use crate::util::*;
use bytes::{Buf, BufMut, Bytes};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use std::any::Any;

pub(crate) const SR_HEADER_LENGTH: usize = 24;
pub(crate) const SR_SSRC_OFFSET: usize = 0;
pub(crate) const SR_REPORT_OFFSET: usize = SR_SSRC_OFFSET + SR_HEADER_LENGTH;

/// A SenderReport (SR) packet provides reception quality feedback for an RTP stream
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct SenderReport {
    /// The synchronization source identifier for the originator of this SR packet.
    pub ssrc: u32,
    /// The wallclock time when this report was sent so that it may be used in
    /// combination with timestamps returned in reception reports from other
    /// receivers to measure round-trip propagation to those receivers.
    pub ntp_time: u64,
    /// Corresponds to the same time as the NTP timestamp (above), but in
    /// the same units and with the same random offset as the RTP
    /// timestamps in data packets.
    pub rtp_time: u32,
    /// The total number of RTP data packets transmitted by the sender
    /// since starting transmission up until the time this SR packet was
    /// generated.
    pub packet_count: u32,
    /// The total number of payload octets (i.e., not including header or
    /// padding) transmitted in RTP data packets by the sender since
    /// starting transmission up until the time this SR packet was
    /// generated.
    pub octet_count: u32,
    /// Zero or more reception report blocks depending on the number of other
    /// sources heard by this sender since the last report.
    pub reports: Vec<ReceptionReport>,

    /// profile_extensions contains additional, payload-specific information that needs to
    /// be reported regularly about the sender.
    pub profile_extensions: Bytes,
}

impl SenderReport {
    /// The middle 32 bits of the NTP timestamp, as echoed back in LSR fields.
    pub fn compact_ntp_time(&self) -> u32 {
        (self.ntp_time >> 16) as u32
    }
}

impl Packet for SenderReport {
    fn header(&self) -> Header {
        Header {
            padding: get_padding_size(self.raw_size()) != 0,
            count: self.reports.len() as u8,
            packet_type: PacketType::SenderReport,
            length: ((self.marshal_size() / 4) - 1) as u16,
        }
    }

    /// destination_ssrc returns an array of SSRC values that this packet refers to.
    fn destination_ssrc(&self) -> Vec<u32> {
        let mut out: Vec<u32> = self.reports.iter().map(|x| x.ssrc).collect();
        out.push(self.ssrc);
        out
    }

    fn raw_size(&self) -> usize {
        let mut reps_length = 0;
        for rep in &self.reports {
            reps_length += rep.marshal_size();
        }

        HEADER_LENGTH + SR_HEADER_LENGTH + reps_length + self.profile_extensions.len()
    }

    fn as_any(&self) -> &(dyn Any) {
        self
    }

    fn equal(&self, other: &(dyn Packet)) -> bool {
        other.as_any().downcast_ref::<SenderReport>() == Some(self)
    }

    fn cloned(&self) -> Box<dyn Packet> {
        Box::new(self.clone())
    }
}

impl MarshalSize for SenderReport {
    fn marshal_size(&self) -> usize {
        let l = self.raw_size();
        // align to 32-bit boundary
        l + get_padding_size(l)
    }
}

impl Marshal for SenderReport {
    /// marshal_to encodes the packet in binary.
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if self.reports.len() > COUNT_MAX {
            return Err(Error::TooManyReports);
        }

        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::BufferTooShort);
        }

        /*
         *         0                   1                   2                   3
         *         0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
         *        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * header |V=2|P|    RC   |   PT=SR=200   |             length            |
         *        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         *        |                         SSRC of sender                        |
         *        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
         * sender |              NTP timestamp, most significant word             |
         * info   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         *        |             NTP timestamp, least significant word             |
         *        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         *        |                         RTP timestamp                         |
         *        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         *        |                     sender's packet count                     |
         *        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         *        |                      sender's octet count                     |
         *        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
         * report |                 SSRC_1 (SSRC of first source)                 |
         * block  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         *        |                              ...                              |
         *        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
         *        |                  profile-specific extensions                  |
         *        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         */
        let mut header = self.header();
        header.padding = false;
        let n = header.marshal_to(buf)?;
        buf = &mut buf[n..];

        buf.put_u32(self.ssrc);
        buf.put_u64(self.ntp_time);
        buf.put_u32(self.rtp_time);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);

        for report in &self.reports {
            let n = report.marshal_to(buf)?;
            buf = &mut buf[n..];
        }

        buf.put(self.profile_extensions.clone());
        let padding_size = get_padding_size(self.profile_extensions.len());
        buf.put_bytes(0, padding_size);

        Ok(self.marshal_size())
    }
}

impl Unmarshal for SenderReport {
    /// Unmarshal decodes the SenderReport from binary
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        if header.packet_type != PacketType::SenderReport {
            return Err(Error::WrongType);
        }

        let mut body = read_body(raw_packet, &header)?;
        if body.remaining() < SR_HEADER_LENGTH + header.count as usize * RECEPTION_REPORT_LENGTH
        {
            return Err(Error::PacketTooShort);
        }

        let ssrc = body.get_u32();
        let ntp_time = body.get_u64();
        let rtp_time = body.get_u32();
        let packet_count = body.get_u32();
        let octet_count = body.get_u32();

        let mut reports = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            reports.push(ReceptionReport::unmarshal(&mut body)?);
        }

        let profile_extensions = body.copy_to_bytes(body.remaining());

        Ok(SenderReport {
            ssrc,
            ntp_time,
            rtp_time,
            packet_count,
            octet_count,
            reports,
            profile_extensions,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sender_report_unmarshal() {
        let tests = vec![
            (
                "valid",
                Bytes::from_static(&[
                    0x81u8, 0xc8, 0x0, 0xc, // v=2, p=0, count=1, SR, len=12
                    0x90, 0x2f, 0x9e, 0x2e, // ssrc=0x902f9e2e
                    0xda, 0x8b, 0xd1, 0xfc, 0xdd, 0xdd, 0xa0, 0x5a, // ntp=0xda8bd1fcdddda05a
                    0xaa, 0xf4, 0xed, 0xd5, // rtp=0xaaf4edd5
                    0x00, 0x00, 0x00, 0x01, // packetCount=1
                    0x00, 0x00, 0x00, 0x02, // octetCount=2
                    0xbc, 0x5e, 0x9a, 0x40, // ssrc=0xbc5e9a40
                    0x0, 0x0, 0x0, 0x0, // fracLost=0, totalLost=0
                    0x0, 0x0, 0x46, 0xe1, // lastSeq=0x46e1
                    0x0, 0x0, 0x1, 0x11, // jitter=273
                    0x9, 0xf3, 0x64, 0x32, // lsr=0x9f36432
                    0x0, 0x2, 0x4a, 0x79, // delay=150137
                ]),
                SenderReport {
                    ssrc: 0x902f9e2e,
                    ntp_time: 0xda8bd1fcdddda05a,
                    rtp_time: 0xaaf4edd5,
                    packet_count: 1,
                    octet_count: 2,
                    reports: vec![ReceptionReport {
                        ssrc: 0xbc5e9a40,
                        fraction_lost: 0,
                        total_lost: 0,
                        last_sequence_number: 0x46e1,
                        jitter: 273,
                        last_sender_report: 0x9f36432,
                        delay: 150137,
                    }],
                    profile_extensions: Bytes::new(),
                },
                None,
            ),
            (
                "wrong type",
                Bytes::from_static(&[
                    0x81, 0xc9, 0x0, 0x1, // v=2, p=0, count=1, RR, len=1
                    0x90, 0x2f, 0x9e, 0x2e, // ssrc=0x902f9e2e
                ]),
                SenderReport::default(),
                Some(Error::WrongType),
            ),
            (
                "short sender info",
                Bytes::from_static(&[
                    0x80, 0xc8, 0x0, 0x1, // v=2, p=0, count=0, SR, len=1
                    0x90, 0x2f, 0x9e, 0x2e, // ssrc=0x902f9e2e
                ]),
                SenderReport::default(),
                Some(Error::PacketTooShort),
            ),
        ];

        for (name, data, want, want_error) in tests {
            let buf = &mut data.clone();
            let got = SenderReport::unmarshal(buf);

            assert_eq!(
                got.is_err(),
                want_error.is_some(),
                "Unmarshal {name}: err = {got:?}, want {want_error:?}"
            );

            if let Some(err) = want_error {
                assert_eq!(Err(err), got, "Unmarshal {name}");
            } else if let Ok(got) = got {
                assert_eq!(got, want, "Unmarshal {name}");
                assert_eq!(got.compact_ntp_time(), 0xd1fcdddd);
                let raw = got.marshal().expect("marshal");
                assert_eq!(raw, data, "Marshal {name}");
            }
        }
    }
}
