// The RESP2 wire protocol: value model, command encoding, reply parsing.

mod command;
mod encode;
mod parse;
mod value;

pub use {
    command::{Arg, Command, CommandOptions, ToArg},
    encode::{DecodePolicy, Encoder},
    parse::Parser,
    value::Value,
};
