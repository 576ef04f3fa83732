//! Fixed-length bit sets that stay allocation-free when small.

const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-length set of bits.
///
/// Masks of up to 64 bits live inline; longer masks own a heap array of
/// words. The length is fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitMask {
    /// Up to 64 bits stored in a single word.
    Inline {
        /// Bit storage; bits at or above `len` are always zero.
        bits: u64,
        /// Number of addressable bits.
        len: usize,
    },
    /// More than 64 bits.
    Heap {
        /// Bit storage; bits at or above `len` are always zero.
        words: Box<[u64]>,
        /// Number of addressable bits.
        len: usize,
    },
}

impl BitMask {
    /// Creates a mask of `len` cleared bits.
    #[must_use]
    pub fn new(len: usize) -> Self {
        if len <= WORD_BITS {
            Self::Inline { bits: 0, len }
        } else {
            Self::Heap {
                words: vec![0; len.div_ceil(WORD_BITS)].into_boxed_slice(),
                len,
            }
        }
    }

    /// Returns `true` if no heap storage backs this mask.
    #[must_use]
    pub const fn is_inline(&self) -> bool {
        matches!(self, Self::Inline { .. })
    }

    /// Number of addressable bits.
    #[must_use]
    pub const fn len(&self) -> usize {
        match self {
            Self::Inline { len, .. } | Self::Heap { len, .. } => *len,
        }
    }

    /// Returns `true` if the mask has no addressable bits.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn word_and_bit(&self, index: usize) -> (usize, u64) {
        assert!(
            index < self.len(),
            "bit index {index} out of range for mask of {} bits",
            self.len()
        );
        (index / WORD_BITS, 1 << (index % WORD_BITS))
    }

    /// Returns the bit at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        let (word, bit) = self.word_and_bit(index);
        match self {
            Self::Inline { bits, .. } => bits & bit != 0,
            Self::Heap { words, .. } => words[word] & bit != 0,
        }
    }

    /// Sets the bit at `index`, returning its previous value.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn set(&mut self, index: usize) -> bool {
        let (word, bit) = self.word_and_bit(index);
        let slot = match self {
            Self::Inline { bits, .. } => bits,
            Self::Heap { words, .. } => &mut words[word],
        };
        let was = *slot & bit != 0;
        *slot |= bit;
        was
    }

    /// Clears the bit at `index`, returning its previous value.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn clear(&mut self, index: usize) -> bool {
        let (word, bit) = self.word_and_bit(index);
        let slot = match self {
            Self::Inline { bits, .. } => bits,
            Self::Heap { words, .. } => &mut words[word],
        };
        let was = *slot & bit != 0;
        *slot &= !bit;
        was
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_ones(&self) -> usize {
        match self {
            Self::Inline { bits, .. } => bits.count_ones() as usize,
            Self::Heap { words, .. } => words.iter().map(|w| w.count_ones() as usize).sum(),
        }
    }

    /// Iterates the indices of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        let words: &[u64] = match self {
            Self::Inline { bits, .. } => std::slice::from_ref(bits),
            Self::Heap { words, .. } => words,
        };
        words.iter().enumerate().flat_map(|(i, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(i * WORD_BITS + bit)
            })
        })
    }
}
