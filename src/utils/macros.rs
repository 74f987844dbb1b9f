///////////////////
// Vector macros //
///////////////////

/// Panics unless all given slices or vectors have the same length.
#[macro_export]
macro_rules! assert_same_len {
    ($first:expr $(, $rest:expr)+ $(,)?) => {{
        let expected = $first.len();
        $(
            assert_eq!(
                expected,
                $rest.len(),
                "Length mismatch between `{}` and `{}`",
                stringify!($first),
                stringify!($rest)
            );
        )+
    }};
}
