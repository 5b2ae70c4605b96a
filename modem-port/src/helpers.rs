use core::fmt;

/// Wrapper rendering raw serial traffic for the logs.
///
/// Printable ASCII is shown as-is, `\r` and `\n` as `<CR>` and `<LF>`, and
/// every other byte as `\NNN` (decimal).
pub struct LossyStr<'a>(pub &'a [u8]);

impl fmt::Debug for LossyStr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("'")?;
        for &b in self.0 {
            match b {
                b'\r' => f.write_str("<CR>")?,
                b'\n' => f.write_str("<LF>")?,
                0x20..=0x7e => write!(f, "{}", b as char)?,
                _ => write!(f, "\\{}", b)?,
            }
        }
        f.write_str("'")
    }
}

impl fmt::Display for LossyStr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub trait SliceExt {
    fn find(&self, needle: &[u8]) -> Option<usize>;
    fn rfind(&self, needle: &[u8]) -> Option<usize>;
}

impl SliceExt for [u8] {
    fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        self.windows(needle.len()).position(|window| window == needle)
    }

    fn rfind(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(self.len());
        }
        self.windows(needle.len()).rposition(|window| window == needle)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn find() {
        assert_eq!(b"AT+CSQ\r\r\n".find(b"\r\n"), Some(7));
        assert_eq!(b"AT+CSQ".find(b"\r\n"), None);
        assert_eq!(b"\r\n+CSQ: 1\r\n".rfind(b"\r\n"), Some(9));
    }

    #[test]
    fn lossy_str_escapes_control_bytes() {
        assert_eq!(
            format!("{:?}", LossyStr(b"AT\r\n\x1a")),
            "'AT<CR><LF>\\26'"
        );
    }
}
