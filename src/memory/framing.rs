//! Size classes and unit framing.
//!
//! A size class `c` serves requests of `c * WORD + 1 ..= (c + 1) * WORD`
//! bytes. The framing policy decides the byte layout of a handed-out unit:
//! [`WithHeader`] prefixes one hidden word holding the requested size,
//! [`NoHeader`] hands the unit out bare and relies on the caller to pass the
//! size back on free. Both plug into the same pool engine.

use std::ptr::NonNull;

/// Machine word; also the size-class step and the minimum alignment.
pub const WORD: usize = size_of::<usize>();

pub const POOL_CLASS_COUNT: usize = 16;

/// Largest request served from a pool. Anything bigger goes to the fallback.
pub const MAX_POOL_UNIT: usize = POOL_CLASS_COUNT * WORD;

/// Size class for `size`, or `None` when the request is zero or oversize.
#[inline]
pub const fn class_of(size: usize) -> Option<usize> {
    if size == 0 || size > MAX_POOL_UNIT {
        None
    } else {
        Some((size - 1) / WORD)
    }
}

/// Usable bytes of a unit in `class`, header excluded.
#[inline]
pub const fn class_capacity(class: usize) -> usize {
    (class + 1) * WORD
}

/// Strategy deciding whether a unit records its own size.
pub trait FramingPolicy: Send + Sync + 'static {
    /// Hidden bytes in front of every handed-out pointer.
    const HEADER_BYTES: usize;

    /// Pool unit size for `class`, header included.
    #[inline]
    fn unit_size(class: usize) -> usize {
        class_capacity(class) + Self::HEADER_BYTES
    }

    /// Turn a raw pool unit into the pointer handed to the caller.
    ///
    /// # Safety
    /// `unit` must span at least `HEADER_BYTES + size` writable bytes.
    unsafe fn frame_pool_unit(unit: NonNull<u8>, size: usize) -> NonNull<u8>;

    /// Turn a fallback block of `size + HEADER_BYTES` bytes into the pointer
    /// handed to the caller.
    ///
    /// # Safety
    /// Same as [`frame_pool_unit`](FramingPolicy::frame_pool_unit).
    unsafe fn frame_proxy_unit(block: NonNull<u8>, size: usize) -> NonNull<u8>;

    /// Recover the unit or block start from a handed-out pointer.
    ///
    /// # Safety
    /// `ptr` must have come from one of the `frame_*` functions of this policy.
    unsafe fn unframe(ptr: NonNull<u8>) -> NonNull<u8>;

    /// The size recorded for `ptr`, if this policy records one.
    ///
    /// # Safety
    /// Same as [`unframe`](FramingPolicy::unframe).
    unsafe fn read_size(ptr: NonNull<u8>) -> Option<usize>;
}

/// Every unit carries its requested size in the word before the pointer.
/// Sizes above [`MAX_POOL_UNIT`] mark fallback blocks.
#[derive(Clone, Copy, Debug, Default)]
pub struct WithHeader;

impl WithHeader {
    /// # Safety
    /// `ptr` must have been framed by this policy.
    #[inline]
    pub(crate) unsafe fn recorded_size(ptr: NonNull<u8>) -> usize {
        // Safety: the header word sits right before `ptr` and is word aligned.
        unsafe { ptr.as_ptr().cast::<usize>().sub(1).read() }
    }

    #[inline]
    unsafe fn frame(unit: NonNull<u8>, size: usize) -> NonNull<u8> {
        // Safety: unit is word aligned and spans at least the header word.
        unsafe {
            unit.as_ptr().cast::<usize>().write(size);
            unit.add(WORD)
        }
    }
}

impl FramingPolicy for WithHeader {
    const HEADER_BYTES: usize = WORD;

    #[inline]
    unsafe fn frame_pool_unit(unit: NonNull<u8>, size: usize) -> NonNull<u8> {
        debug_assert!(size <= MAX_POOL_UNIT);
        // Safety: forwarded contract.
        unsafe { Self::frame(unit, size) }
    }

    #[inline]
    unsafe fn frame_proxy_unit(block: NonNull<u8>, size: usize) -> NonNull<u8> {
        debug_assert!(size > MAX_POOL_UNIT);
        // Safety: forwarded contract.
        unsafe { Self::frame(block, size) }
    }

    #[inline]
    unsafe fn unframe(ptr: NonNull<u8>) -> NonNull<u8> {
        // Safety: the header precedes ptr inside the same unit.
        unsafe { ptr.sub(WORD) }
    }

    #[inline]
    unsafe fn read_size(ptr: NonNull<u8>) -> Option<usize> {
        // Safety: forwarded contract.
        Some(unsafe { Self::recorded_size(ptr) })
    }
}

/// Units are handed out bare; the caller passes the size back on free.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHeader;

impl FramingPolicy for NoHeader {
    const HEADER_BYTES: usize = 0;

    #[inline]
    unsafe fn frame_pool_unit(unit: NonNull<u8>, _size: usize) -> NonNull<u8> {
        unit
    }

    #[inline]
    unsafe fn frame_proxy_unit(block: NonNull<u8>, _size: usize) -> NonNull<u8> {
        block
    }

    #[inline]
    unsafe fn unframe(ptr: NonNull<u8>) -> NonNull<u8> {
        ptr
    }

    #[inline]
    unsafe fn read_size(_ptr: NonNull<u8>) -> Option<usize> {
        None
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_class_boundaries() {
        assert_eq!(class_of(0), None);
        assert_eq!(class_of(1), Some(0));
        assert_eq!(class_of(WORD), Some(0));
        assert_eq!(class_of(WORD + 1), Some(1));
        assert_eq!(class_of(MAX_POOL_UNIT), Some(POOL_CLASS_COUNT - 1));
        assert_eq!(class_of(MAX_POOL_UNIT + 1), None);
    }

    #[test]
    fn test_unit_sizes() {
        assert_eq!(NoHeader::unit_size(3), 32);
        assert_eq!(WithHeader::unit_size(3), 32 + WORD);
        assert_eq!(NoHeader::unit_size(POOL_CLASS_COUNT - 1), MAX_POOL_UNIT);
    }

    #[test]
    fn test_header_round_trip() {
        let mut unit = [0usize; 4];
        let raw = NonNull::from(&mut unit).cast::<u8>();
        // Safety: Test code; unit spans 4 words.
        unsafe {
            let user = WithHeader::frame_pool_unit(raw, 17);
            assert_eq!(user.as_ptr().addr(), raw.as_ptr().addr() + WORD);
            assert_eq!(WithHeader::read_size(user), Some(17));
            assert_eq!(WithHeader::unframe(user), raw);
        }
    }

    #[test]
    fn test_no_header_is_identity() {
        let mut unit = [0usize; 2];
        let raw = NonNull::from(&mut unit).cast::<u8>();
        // Safety: Test code.
        unsafe {
            assert_eq!(NoHeader::frame_pool_unit(raw, 9), raw);
            assert_eq!(NoHeader::unframe(raw), raw);
            assert_eq!(NoHeader::read_size(raw), None);
        }
    }

    proptest! {
        #[test]
        fn prop_class_covers_request(size in 1usize..=MAX_POOL_UNIT) {
            let class = class_of(size).unwrap();
            prop_assert!(class < POOL_CLASS_COUNT);
            prop_assert!(class_capacity(class) >= size);
            // Smallest class that fits: the one below would be too small.
            if class > 0 {
                prop_assert!(class_capacity(class - 1) < size);
            }
        }

        #[test]
        fn prop_oversize_has_no_class(size in (MAX_POOL_UNIT + 1)..usize::MAX) {
            prop_assert_eq!(class_of(size), None);
        }

        #[test]
        fn prop_unit_sizes_keep_word_alignment(class in 0usize..POOL_CLASS_COUNT) {
            prop_assert_eq!(WithHeader::unit_size(class) % WORD, 0);
            prop_assert_eq!(NoHeader::unit_size(class) % WORD, 0);
        }
    }
}
