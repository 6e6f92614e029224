use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Byte offset into an instruction stream.
///
/// Instructions have different encoded widths, so positions in the stream are tracked as byte
/// offsets rather than instruction counts. Branch operands are the difference of two offsets.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Offset(pub usize);

impl Offset {
    pub const START: Offset = Offset(0);
}

impl Add<usize> for Offset {
    type Output = Offset;

    fn add(self, width: usize) -> Offset {
        Offset(self.0 + width)
    }
}

impl AddAssign<usize> for Offset {
    fn add_assign(&mut self, width: usize) {
        self.0 += width;
    }
}

impl Sub for Offset {
    type Output = isize;

    fn sub(self, other: Offset) -> isize {
        (self.0 as isize) - (other.0 as isize)
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("IL_{:04x}", self.0))
    }
}
