//! Random voucher codes.
//!
//! Codes look like `VC-7K2QX9PLA0`: a fixed prefix followed by ten symbols drawn
//! uniformly from `A-Z0-9`. With 36^10 possible suffixes collisions are rare; the
//! store's unique index on `code` catches the ones that happen and the allocator
//! retries with a fresh code.

use rand::Rng;
use voucher_core::environment::CodeGenerator;
use voucher_core::VoucherCode;

/// Prefix shared by every generated code.
pub const CODE_PREFIX: &str = "VC-";

/// Number of random symbols after the prefix.
pub const CODE_LENGTH: usize = 10;

const ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Thread-local RNG backed [`CodeGenerator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomCodeGenerator;

impl RandomCodeGenerator {
    /// Create a generator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self) -> VoucherCode {
        let mut rng = rand::thread_rng();
        let mut code = String::with_capacity(CODE_PREFIX.len() + CODE_LENGTH);
        code.push_str(CODE_PREFIX);
        for _ in 0..CODE_LENGTH {
            code.push(char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]));
        }
        VoucherCode::new(code)
    }
}
