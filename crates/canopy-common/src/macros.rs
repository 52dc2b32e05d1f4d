//! Macros shared by the canopy crates.

#[macro_export]
/// Implements `From<$from_thing>` for an error enum by wrapping the value in `$field`.
///
/// Lets `?` lift lower level errors into the enum of the calling layer.
///
/// # Example
///
/// ```rust
/// # use canopy_common::impl_error_from;
/// enum StoreError {
///     Io(std::io::Error),
///     Height(std::num::ParseIntError),
/// }
///
/// impl_error_from!(StoreError, std::io::Error, Io);
/// impl_error_from!(StoreError, std::num::ParseIntError, Height);
///
/// fn parse_height(s: &str) -> Result<u32, StoreError> {
///     Ok(s.parse()?)
/// }
/// ```
macro_rules! impl_error_from {
    ($thing:ty, $from_thing:ty, $field:ident) => {
        impl From<$from_thing> for $thing {
            fn from(e: $from_thing) -> Self {
                <$thing>::$field(e)
            }
        }
    };
}

#[macro_export]
/// Panic if the expression is not `Ok(_)`.
///
/// ```rust
/// # use canopy_common::assert_ok;
/// assert_ok!(Ok::<u32, &str>(70016));
/// ```
///
/// ```rust,should_panic
/// # use canopy_common::assert_ok;
/// assert_ok!(Err::<u32, &str>("checksum mismatch"));
/// ```
macro_rules! assert_ok {
    ($expr:expr $(,)?) => {
        if let Err(e) = $expr {
            panic!("assertion failed: expected `Ok(_)`, got `Err({:?})`", e);
        }
    };
}

#[macro_export]
/// Panic if the expression is not `Err(_)`.
///
/// ```rust
/// # use canopy_common::assert_err;
/// assert_err!(Err::<u32, &str>("too large"));
/// ```
///
/// ```rust,should_panic
/// # use canopy_common::assert_err;
/// assert_err!(Ok::<u32, &str>(1));
/// ```
macro_rules! assert_err {
    ($expr:expr $(,)?) => {
        if let Ok(v) = $expr {
            panic!("assertion failed: expected `Err(_)`, got `Ok({:?})`", v);
        }
    };
}

#[macro_export]
/// Builds a `BlockHash` from a hex literal, rejecting malformed literals at compile time.
/// Requires `FromStr` and `BlockHash` in scope.
macro_rules! bhash {
    ($s:expr) => {{
        const _: () = match $crate::macros::validate_hash_compile_time($s) {
            Ok(()) => (),
            Err(e) => panic!("{}", e),
        };
        BlockHash::from_str($s).expect("Literal should be valid")
    }};
}

#[doc(hidden)]
pub const fn validate_hash_compile_time(s: &str) -> Result<(), &str> {
    let bytes = s.as_bytes();

    // One ASCII hex digit per byte, 32 bytes of hash
    if bytes.len() != 64 {
        return Err("Hash literal is not exactly 64 hex digits");
    }

    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if !(b.is_ascii_digit() || (b >= b'a' && b <= b'f') || (b >= b'A' && b <= b'F')) {
            return Err("Hash literal contains an invalid ASCII hex digit");
        }
        i += 1;
    }

    Ok(())
}
