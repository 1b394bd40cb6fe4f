//! The tagged 32-bit word universe.
//!
//! Every Suo value is a single 32-bit word whose low bits classify it:
//!
//! ```text
//! 000 - even integers
//! 100 - odd integers
//! 001 - pairs
//! 010 - vectors
//! 011 - records
//! 101 - byte vectors and code blocks
//! 110 - record descriptors
//! 111 - characters, booleans, empty list, unspecified, headers
//! ```
//!
//! Integers use the leftmost tag bit as part of the value and so cover the
//! full 30-bit signed range. Pointer payloads are byte offsets into the heap
//! and always multiples of 8, which is why the three tag bits can simply be
//! masked off.

/// A raw 32-bit heap word.
pub type Word = u32;

/// The small-integer range: 30 bits, signed.
pub const FIXNUM_MIN: i32 = -536870912;
pub const FIXNUM_MAX: i32 = 536870911;

/// A Suo value, represented as one tagged word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Value(Word);

impl Value {
    pub const FALSE: Value = Value::special(0);
    pub const TRUE: Value = Value::special(1);
    pub const NIL: Value = Value::special(2);
    pub const UNSPEC: Value = Value::special(3);

    const fn special(payload: Word) -> Value {
        Value((payload << 6) | 0x37)
    }

    pub fn from_raw(word: Word) -> Value {
        Value(word)
    }

    pub fn raw(self) -> Word {
        self.0
    }

    /// The low three bits.
    pub fn tag(self) -> Word {
        self.0 & 7
    }

    /// True for values whose payload is a heap offset. Integers (2-bit tag
    /// zero) and the immediate family (3-bit tag 7) are excluded.
    pub fn is_ptr(self) -> bool {
        self.0 & 3 != 0 && self.0 & 7 != 7
    }

    /// Heap byte offset of a pointer value, any tag.
    pub fn ptr_offset(self) -> usize {
        (self.0 & !7) as usize
    }

    /// Re-attach `tag` to a heap byte offset.
    pub fn from_ptr(offset: usize, tag: Word) -> Value {
        debug_assert!(offset % 8 == 0);
        Value(offset as Word | tag)
    }

    // Small integers.

    pub fn is_fixnum(self) -> bool {
        self.0 & 3 == 0
    }

    pub fn fixnum(n: i32) -> Value {
        debug_assert!((FIXNUM_MIN..=FIXNUM_MAX).contains(&n));
        Value((n as Word) << 2)
    }

    pub fn as_fixnum(self) -> i32 {
        (self.0 as i32) >> 2
    }

    // Characters.

    pub fn is_char(self) -> bool {
        self.0 & 0x3f == 0x27
    }

    pub fn character(code: u32) -> Value {
        Value((code << 6) | 0x27)
    }

    pub fn char_code(self) -> u32 {
        self.0 >> 6
    }

    // Heap object kinds, judged from the value tag alone.

    pub fn is_pair(self) -> bool {
        self.0 & 7 == 1
    }

    pub fn is_vec(self) -> bool {
        self.0 & 7 == 2
    }

    pub fn is_rec(self) -> bool {
        self.0 & 7 == 3
    }

    pub fn is_bytev(self) -> bool {
        self.0 & 7 == 5
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_fixnum() {
            write!(f, "{}", self.as_fixnum())
        } else if self.is_char() {
            write!(f, "#x{:x}", self.char_code())
        } else if *self == Value::NIL {
            write!(f, "()")
        } else if *self == Value::TRUE {
            write!(f, "#t")
        } else if *self == Value::FALSE {
            write!(f, "#f")
        } else if *self == Value::UNSPEC {
            write!(f, "#unspec")
        } else {
            write!(f, "<{:03o}@{:#x}>", self.tag(), self.ptr_offset())
        }
    }
}

/// Header words. Headers only appear as the first word of vectors, byte
/// vectors, and code blocks; they share the 3-bit tag 7 with characters and
/// specials and are told apart by wider tags:
///
/// ```text
///   1111 - vectors
/// 000111 - byte vectors
/// 010111 - code blocks
/// 100111 - characters
/// 110111 - special values
/// ```
pub mod head {
    use super::Word;

    pub fn vec(len: usize) -> Word {
        ((len as Word) << 4) | 0xf
    }

    pub fn is_vec(h: Word) -> bool {
        h & 0xf == 0xf
    }

    pub fn vec_len(h: Word) -> usize {
        (h >> 4) as usize
    }

    pub fn bytev(len: usize) -> Word {
        ((len as Word) << 6) | 0x07
    }

    pub fn is_bytev(h: Word) -> bool {
        h & 0x3f == 0x07
    }

    pub fn bytev_len(h: Word) -> usize {
        (h >> 6) as usize
    }

    pub fn code(len: usize) -> Word {
        ((len as Word) << 6) | 0x17
    }

    pub fn is_code(h: Word) -> bool {
        h & 0x3f == 0x17
    }

    /// A record's first word: a descriptor-tagged pointer to its type record.
    pub fn is_rec_desc(h: Word) -> bool {
        h & 7 == 6
    }

    /// Decide whether a word found at the start of a heap object belongs to a
    /// pair. Pairs carry no header, so they are identified by exclusion: the
    /// first word is an ordinary value rather than a header or a record
    /// descriptor.
    pub fn starts_pair(h: Word) -> bool {
        if h & 7 == 7 {
            let t = h & 0x3f;
            t == 0x27 || t == 0x37
        } else {
            h & 7 != 6
        }
    }
}
