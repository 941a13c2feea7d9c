//! Small shared helpers.

/// Integer division rounding up.
pub fn ceil_divide(numerator: u64, denominator: u64) -> u64 {
    debug_assert!(denominator != 0);
    (numerator + denominator - 1) / denominator
}

/// Rounds `value` up to a multiple of `alignment`.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    ceil_divide(value, alignment) * alignment
}

/// Emits a log record at most once for the lifetime of the process.
///
/// Used on per-frame paths where a condition can hold for thousands of
/// consecutive frames and would otherwise flood the log.
macro_rules! log_once {
    ($level:ident, $($arg:tt)*) => {{
        static ONCE: ::std::sync::Once = ::std::sync::Once::new();
        ONCE.call_once(|| ::log::$level!($($arg)*));
    }};
}

pub(crate) use log_once;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_divide_rounds_up() {
        assert_eq!(ceil_divide(0, 4), 0);
        assert_eq!(ceil_divide(1, 4), 1);
        assert_eq!(ceil_divide(4, 4), 1);
        assert_eq!(ceil_divide(5, 4), 2);
        assert_eq!(ceil_divide(255, 8), 32);
    }

    #[test]
    fn align_up_to_buffer_alignments() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(257, 256), 512);
    }
}
