//! Bounds-checked views of packed buffers.
//!
//! A span pairs raw packed storage with its logical sample capacity. Offsets
//! into a span always count logical samples; each codec maps the logical
//! offset to its physical layout (for NUQ two logical samples share one
//! byte, plus a per-group header). Violating the bounds is a programmer
//! error and panics; hot decode loops carry no recoverable error paths.

/// Read-only view of a packed buffer holding `num` logical samples.
#[derive(Clone, Copy)]
pub struct PackedSpan<'a, P> {
    pub(crate) data: &'a [P],
    num: usize,
}

/// Mutable view of a packed buffer holding `num` logical samples.
pub struct PackedSpanMut<'a, P> {
    pub(crate) data: &'a mut [P],
    num: usize,
}

/// Wraps `data` as a span over `num` logical samples. `data` must be at
/// least the codec's `packed_len(num)` storage elements.
#[inline]
pub fn make_span<P>(data: &[P], num: usize) -> PackedSpan<'_, P> {
    PackedSpan { data, num }
}

/// Mutable counterpart of [`make_span`].
#[inline]
pub fn make_span_mut<P>(data: &mut [P], num: usize) -> PackedSpanMut<'_, P> {
    PackedSpanMut { data, num }
}

impl<'a, P> PackedSpan<'a, P> {
    /// Logical sample capacity.
    #[inline(always)]
    pub fn num(&self) -> usize {
        self.num
    }

    /// Panics unless samples `[ofs, ofs + num)` lie inside the span.
    #[inline(always)]
    pub fn bounds_check(&self, ofs: usize, num: usize) {
        assert!(
            ofs + num <= self.num,
            "packed span overrun: ofs {ofs} + num {num} > capacity {}",
            self.num
        );
    }
}

impl<'a, P> PackedSpanMut<'a, P> {
    /// Logical sample capacity.
    #[inline(always)]
    pub fn num(&self) -> usize {
        self.num
    }

    /// Panics unless samples `[ofs, ofs + num)` lie inside the span.
    #[inline(always)]
    pub fn bounds_check(&self, ofs: usize, num: usize) {
        assert!(
            ofs + num <= self.num,
            "packed span overrun: ofs {ofs} + num {num} > capacity {}",
            self.num
        );
    }

    /// Erases mutability.
    #[inline(always)]
    pub fn as_const(&self) -> PackedSpan<'_, P> {
        PackedSpan {
            data: self.data,
            num: self.num,
        }
    }

    /// Reborrows, so the span can be handed to more than one codec call.
    #[inline(always)]
    pub fn reborrow(&mut self) -> PackedSpanMut<'_, P> {
        PackedSpanMut {
            data: self.data,
            num: self.num,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_bounds_passes() {
        let buf = [0u8; 16];
        let span = make_span(&buf, 16);
        span.bounds_check(0, 16);
        span.bounds_check(8, 8);
    }

    #[test]
    #[should_panic(expected = "packed span overrun")]
    fn overrun_panics() {
        let buf = [0u8; 16];
        make_span(&buf, 16).bounds_check(9, 8);
    }
}
