use crate::header::*;
use crate::packet::Packet;
use crate::util::*;
use bytes::{Buf, BufMut};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use std::any::Any;

const PLI_LENGTH: usize = 2;

/// The PictureLossIndication packet informs the encoder about the loss of an undefined amount of coded video data belonging to one or more pictures
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct PictureLossIndication {
    /// SSRC of sender
    pub sender_ssrc: u32,
    /// SSRC where the loss was experienced
    pub media_ssrc: u32,
}

impl Packet for PictureLossIndication {
    fn header(&self) -> Header {
        Header {
            padding: false,
            count: FORMAT_PLI,
            packet_type: PacketType::PayloadSpecificFeedback,
            length: PLI_LENGTH as u16,
        }
    }

    /// destination_ssrc returns an array of SSRC values that this packet refers to.
    fn destination_ssrc(&self) -> Vec<u32> {
        vec![self.media_ssrc]
    }

    fn raw_size(&self) -> usize {
        HEADER_LENGTH + SSRC_LENGTH * 2
    }

    fn as_any(&self) -> &(dyn Any) {
        self
    }

    fn equal(&self, other: &(dyn Packet)) -> bool {
        other.as_any().downcast_ref::<PictureLossIndication>() == Some(self)
    }

    fn cloned(&self) -> Box<dyn Packet> {
        Box::new(self.clone())
    }
}

impl MarshalSize for PictureLossIndication {
    fn marshal_size(&self) -> usize {
        let l = self.raw_size();
        // align to 32-bit boundary
        l + get_padding_size(l)
    }
}

impl Marshal for PictureLossIndication {
    /// Marshal encodes the PictureLossIndication in binary
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        /*
         * PLI does not require parameters.  Therefore, the length field MUST be
         * 2, and there MUST NOT be any Feedback Control Information.
         *
         * The semantics of this FB message is independent of the payload type.
         */
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::BufferTooShort);
        }

        let h = self.header();
        let n = h.marshal_to(buf)?;
        buf = &mut buf[n..];

        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);

        Ok(self.marshal_size())
    }
}

impl Unmarshal for PictureLossIndication {
    /// Unmarshal decodes the PictureLossIndication from binary
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let h = Header::unmarshal(raw_packet)?;
        if h.packet_type != PacketType::PayloadSpecificFeedback || h.count != FORMAT_PLI {
            return Err(Error::WrongType);
        }

        let mut body = read_body(raw_packet, &h)?;
        if body.remaining() < SSRC_LENGTH * 2 {
            return Err(Error::PacketTooShort);
        }

        let sender_ssrc = body.get_u32();
        let media_ssrc = body.get_u32();

        Ok(PictureLossIndication {
            sender_ssrc,
            media_ssrc,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_picture_loss_indication_unmarshal() {
        let tests = vec![
            (
                "valid",
                Bytes::from_static(&[
                    0x81, 0xce, 0x00, 0x02, // v=2, p=0, FMT=1, PSFB, len=1
                    0x00, 0x00, 0x00, 0x00, // ssrc=0x0
                    0x4b, 0xc4, 0xfc, 0xb4, // ssrc=0x4bc4fcb4
                ]),
                PictureLossIndication {
                    sender_ssrc: 0x0,
                    media_ssrc: 0x4bc4fcb4,
                },
                None,
            ),
            (
                "packet too short",
                Bytes::from_static(&[0x81, 0xce, 0x00, 0x00]),
                PictureLossIndication::default(),
                Some(Error::PacketTooShort),
            ),
            (
                "invalid header",
                Bytes::from_static(&[
                    0x00, 0xce, 0x00, 0x02, // v=0, p=0, FMT=0, PSFB, len=1
                    0x00, 0x00, 0x00, 0x00, // ssrc=0x0
                    0x4b, 0xc4, 0xfc, 0xb4, // ssrc=0x4bc4fcb4
                ]),
                PictureLossIndication::default(),
                Some(Error::BadVersion),
            ),
            (
                "wrong type",
                Bytes::from_static(&[
                    0x81, 0xc9, 0x00, 0x02, // v=2, p=0, FMT=1, RR, len=1
                    0x00, 0x00, 0x00, 0x00, // ssrc=0x0
                    0x4b, 0xc4, 0xfc, 0xb4, // ssrc=0x4bc4fcb4
                ]),
                PictureLossIndication::default(),
                Some(Error::WrongType),
            ),
            (
                "wrong fmt",
                Bytes::from_static(&[
                    0x82, 0xce, 0x00, 0x02, // v=2, p=0, FMT=2, PSFB, len=1
                    0x00, 0x00, 0x00, 0x00, // ssrc=0x0
                    0x4b, 0xc4, 0xfc, 0xb4, // ssrc=0x4bc4fcb4
                ]),
                PictureLossIndication::default(),
                Some(Error::WrongType),
            ),
        ];

        for (name, data, want, want_error) in tests {
            let buf = &mut data.clone();
            let got = PictureLossIndication::unmarshal(buf);

            assert_eq!(
                got.is_err(),
                want_error.is_some(),
                "Unmarshal {name}: err = {got:?}, want {want_error:?}"
            );

            if let Some(err) = want_error {
                assert_eq!(Err(err), got, "Unmarshal {name}");
            } else if let Ok(got) = got {
                assert_eq!(got, want, "Unmarshal {name}");
                let raw = got.marshal().expect("marshal");
                assert_eq!(raw, data, "Marshal {name}");
            }
        }
    }
}
