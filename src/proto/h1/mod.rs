pub(crate) mod date;
pub(crate) mod decode;
pub(crate) mod encode;
pub(crate) mod io;
pub(crate) mod parse;

pub(crate) use self::decode::{BodyFrame, Decoder, MemRead};
pub(crate) use self::encode::Encoder;
pub(crate) use self::parse::{ParseOptions, RequestParser};
