mod keystream;

pub use keystream::Keystream;
