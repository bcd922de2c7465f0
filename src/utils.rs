use std::ops::{BitAnd, Shl, Shr};

use num::Integer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Make an n_bits-long mask (all ones)
pub fn mask<T>(n_bits: T) -> T
where
    T: Integer + Shl<Output = T>,
{
    (T::one() << n_bits) - T::one()
}

/// Obtain value[end:start] (verilog notation) from value
pub fn extract_field<T>(value: T, end: T, start: T) -> T
where
    T: Copy + Integer + Shl<Output = T> + Shr<Output = T> + BitAnd<Output = T>,
{
    mask(end - start + T::one()) & (value >> start)
}

pub fn interpret_u32_as_signed(value: u32) -> i32 {
    i32::from_ne_bytes(value.to_ne_bytes())
}

pub fn interpret_i32_as_unsigned(value: i32) -> u32 {
    u32::from_ne_bytes(value.to_ne_bytes())
}

/// Take an unsigned value (u8, u16 or u32), and a bit position for the
/// sign bit, and copy the value of the sign bit into all the higher bits
/// of the u32.
pub fn sign_extend<T: Into<u32>>(value: T, sign_bit_position: u32) -> u32 {
    let value: u32 = value.into();
    let sign_bit = 1 & (value >> sign_bit_position);
    if sign_bit == 1 {
        let sign_extension = 0xffff_ffff - mask(sign_bit_position);
        value | sign_extension
    } else {
        value
    }
}

/// Initializes the global tracing subscriber.
///
/// The filter is read from `RUST_LOG` and defaults to `warn`. Log
/// lines go to standard error, because standard output belongs to
/// the guest console.
pub fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn check_extract_field() {
        assert_eq!(extract_field(0xdead_beefu32, 31, 16), 0xdead);
        assert_eq!(extract_field(0xdead_beefu32, 7, 4), 0xe);
        assert_eq!(extract_field(0b1000_0000u32, 7, 7), 1);
    }

    #[test]
    fn check_sign_extend() {
        assert_eq!(sign_extend(0x800u16, 11), 0xffff_f800);
        assert_eq!(sign_extend(0x7ffu16, 11), 0x7ff);
        assert_eq!(sign_extend(0xffu8, 7), 0xffff_ffff);
        assert_eq!(sign_extend(0x1f_fffeu32, 20), 0xffff_fffe);
    }

    #[test]
    fn check_signed_reinterpretation() {
        assert_eq!(interpret_u32_as_signed(0xffff_ffff), -1);
        assert_eq!(interpret_i32_as_unsigned(-3), 0xffff_fffd);
        assert_eq!(interpret_u32_as_signed(interpret_i32_as_unsigned(i32::MIN)), i32::MIN);
    }
}
