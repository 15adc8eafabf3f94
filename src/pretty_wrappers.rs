/// Unit suffixes for [PrettySize], each 1024 times the last.
const UNITS: [&str; 5] = ["b", "kb", "mb", "gb", "tb"];

/// A byte count which displays in the largest whole unit.
///
/// `{}` and `{:#?}` print `2 kb` while `{:?}` keeps the raw byte count so
/// single line logs stay exact.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PrettySize(pub u64);

impl std::fmt::Display for PrettySize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut size = self.0 as f64;
        let mut unit = 0;
        while size >= 1024.0 && unit < UNITS.len() - 1 {
            size /= 1024.0;
            unit += 1;
        }
        write!(f, "{} {}", (size * 100.0).round() / 100.0, UNITS[unit])
    }
}

impl std::fmt::Debug for PrettySize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            std::fmt::Display::fmt(self, f)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A bitmask printed in binary.
///
/// Used for memory type bits and for the words of a free-space bitmap. The
/// alternate form pads to a full 64 bit word so that bitmap rows line up.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PrettyBitflag(pub u64);

impl std::fmt::Debug for PrettyBitflag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            write!(f, "{:064b}", self.0)
        } else {
            write!(f, "{:b}", self.0)
        }
    }
}

impl std::fmt::Display for PrettyBitflag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:b}", self.0)
    }
}
