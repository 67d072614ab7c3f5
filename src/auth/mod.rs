pub mod encrypt;
pub mod token;

pub use encrypt::{EncryptError, Encryptor, LocalEncryptor, SidecarEncryptor, sha256_key};
pub use token::extract_bearer_token;
