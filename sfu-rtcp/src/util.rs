use crate::header::Header;
use bytes::{Buf, Bytes};
use shared::error::{Error, Result};

/// Returns the number of zero bytes needed to align `len` to 32 bits.
pub(crate) fn get_padding_size(len: usize) -> usize {
    if len % 4 == 0 { 0 } else { 4 - (len % 4) }
}

/// Reads the body announced by `header`, with any trailing padding removed.
pub(crate) fn read_body<B: Buf>(raw_packet: &mut B, header: &Header) -> Result<Bytes> {
    let body_len = header.length as usize * 4;
    if raw_packet.remaining() < body_len {
        return Err(Error::PacketTooShort);
    }
    let mut body = raw_packet.copy_to_bytes(body_len);
    if header.padding {
        let padding_len = body.last().copied().unwrap_or(0) as usize;
        if padding_len == 0 || padding_len > body.len() {
            return Err(Error::WrongPadding);
        }
        body.truncate(body.len() - padding_len);
    }
    Ok(body)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::header::PacketType;

    #[test]
    fn test_get_padding() {
        let tests = vec![(0, 0), (1, 3), (2, 2), (3, 1), (4, 0), (100, 0), (500, 0)];
        for (n, p) in tests {
            assert_eq!(get_padding_size(n), p, "Test case returned wrong value for input {n}");
        }
    }

    #[test]
    fn test_read_body_strips_padding() -> Result<()> {
        let header = Header {
            padding: true,
            count: 0,
            packet_type: PacketType::ReceiverReport,
            length: 2,
        };
        let mut raw = &[1u8, 2, 3, 4, 5, 0, 0, 3][..];
        let body = read_body(&mut raw, &header)?;
        assert_eq!(&body[..], &[1, 2, 3, 4, 5]);

        let mut short = &[1u8, 2, 3][..];
        assert_eq!(read_body(&mut short, &header), Err(Error::PacketTooShort));

        let mut bad = &[1u8, 2, 3, 4, 5, 0, 0, 9][..];
        assert_eq!(read_body(&mut bad, &header), Err(Error::WrongPadding));
        Ok(())
    }
}
