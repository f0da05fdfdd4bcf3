use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Splits a byte stream into lines, replacing invalid UTF-8
///
/// Server output is for humans; a stray invalid byte should not end forwarding.
#[derive(Debug, Default, Clone, Copy)]
pub struct LossyLinesCodec;

impl Decoder for LossyLinesCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(newline) = src.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let line = src.split_to(newline + 1);
        Ok(Some(decode_line(&line)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        Ok(Some(decode_line(&rest)))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\n', '\r'])
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_complete_lines() {
        let mut codec = LossyLinesCodec;
        let mut buf = BytesMut::from("serving on 8081\r\npartial");

        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("serving on 8081")
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("partial"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut codec = LossyLinesCodec;
        let mut buf = BytesMut::from(&b"bad \xff byte\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("bad \u{fffd} byte")
        );
    }
}
