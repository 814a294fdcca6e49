use thiserror::Error;

use crate::tag::Tag;

/// What a failed boundary-tag check found
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CorruptionKind {
    /// The chunk being released or resized is not marked in use. This is
    /// what a double release looks like.
    #[error("chunk is not marked in use (double release?)")]
    NotInUse,
    /// The chunk's in-use bit and its successor's previous-in-use bit differ
    #[error("in-use bit disagrees with the next chunk's boundary tag")]
    InUseMismatch,
    /// The chunk's size and its successor's recorded previous size differ
    #[error("size {size} disagrees with the next chunk's boundary tag ({recorded})")]
    SizeMismatch { size: usize, recorded: usize },
    /// The chunk header describes a region outside its pool
    #[error("chunk size {size} runs past the end of the pool")]
    OutOfBounds { size: usize },
    /// Two physically adjacent chunks are both free
    #[error("free chunk follows another free chunk")]
    Uncoalesced,
    /// The free list and the chunk walk disagree on how many chunks are free
    #[error("free list holds {listed} chunks, the pool walk found {found}")]
    FreeListMismatch { listed: usize, found: usize },
}

/// Everything that can go wrong inside the allocator. None of these are
/// returned to C callers: invalid arguments become a null return, everything
/// else ends in [`fatal`](crate::util::print::fatal).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("request of {requested} bytes does not fit in a {capacity} byte pool")]
    TooLarge { requested: usize, capacity: usize },
    #[error("no free chunk of at least {requested} bytes in pool {pool:#x}")]
    Exhausted { pool: Tag, requested: usize },
    #[error("pool region {pool:#x} is already mapped")]
    AddressInUse { pool: Tag },
    #[error("mmap() of pool {pool:#x} failed, errno = {errno}")]
    MapFailed { pool: Tag, errno: i32 },
    #[error("every pool tag is in use")]
    TagsExhausted,
    #[error("heap corruption at chunk {chunk:#x}: {kind}")]
    Corruption { chunk: usize, kind: CorruptionKind },
    #[error("pointer {ptr:#x} does not belong to any pool")]
    ForeignPointer { ptr: usize },
}

/// Why an aligned allocation was refused. Every payload is aligned to
/// [`CHUNK_ALIGNMENT`](crate::alloc::chunk::CHUNK_ALIGNMENT) and nothing
/// stricter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AlignmentError {
    #[error("alignment {0} is not a power of two")]
    NotPowerOfTwo(usize),
    #[error("alignment {0} is stricter than any chunk's")]
    Unsupported(usize),
}

impl AlignmentError {
    /// The `errno` a C caller sees
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotPowerOfTwo(_) => libc::EINVAL,
            Self::Unsupported(_) => libc::ENOMEM,
        }
    }
}

impl PoolError {
    /// Resource exhaustion, as opposed to corruption
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::TooLarge { .. }
                | Self::Exhausted { .. }
                | Self::MapFailed { .. }
                | Self::TagsExhausted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_hex_tags() {
        let err = PoolError::Exhausted {
            pool: 0x1000,
            requested: 64,
        };
        assert_eq!(
            err.to_string(),
            "no free chunk of at least 64 bytes in pool 0x1000"
        );
        assert!(err.is_exhaustion());
    }

    #[test]
    fn corruption_is_not_exhaustion() {
        let err = PoolError::Corruption {
            chunk: 0x1000_0000_0040,
            kind: CorruptionKind::NotInUse,
        };
        assert!(!err.is_exhaustion());
        assert!(err.to_string().contains("double release"));
    }

    #[test]
    fn alignment_errors_map_to_errno() {
        assert_eq!(AlignmentError::NotPowerOfTwo(3).errno(), libc::EINVAL);
        assert_eq!(AlignmentError::Unsupported(64).errno(), libc::ENOMEM);
        assert_eq!(
            AlignmentError::Unsupported(4096).to_string(),
            "alignment 4096 is stricter than any chunk's"
        );
    }
}
