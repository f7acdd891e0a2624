use crate::{protocol::Value, RedisError, RedisResult};

/// A single command argument, ready for wire encoding.
///
/// Booleans and absent values are deliberately not representable here;
/// their [`ToArg`] implementations reject them, since the wire format has
/// no canonical rendering for them and silently picking one tends to hide
/// application bugs.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    /// Raw bytes, passed through unchanged.
    Bytes(Vec<u8>),
    /// Text, encoded as UTF-8.
    Text(String),
    /// A signed integer, rendered as its shortest decimal form.
    Int(i64),
    /// A float, rendered as its shortest round-trippable decimal form.
    Float(f64),
}

impl Arg {
    /// The payload bytes as they go on the wire.
    #[must_use]
    pub fn wire_bytes(&self) -> Vec<u8> {
        match self {
            Self::Bytes(b) => b.clone(),
            Self::Text(s) => s.clone().into_bytes(),
            Self::Int(i) => i.to_string().into_bytes(),
            Self::Float(f) => f.to_string().into_bytes(),
        }
    }
}

/// Conversion of language-native values into command arguments.
///
/// Implementations are fallible on purpose: `bool` and `Option::None`
/// produce [`RedisError::Encode`], surfaced synchronously before any
/// bytes are written.
pub trait ToArg {
    /// Converts `self` into an [`Arg`].
    ///
    /// # Errors
    ///
    /// `RedisError::Encode` for unsupported values.
    fn to_arg(self) -> RedisResult<Arg>;
}

impl ToArg for Arg {
    fn to_arg(self) -> RedisResult<Arg> {
        Ok(self)
    }
}
impl ToArg for &[u8] {
    fn to_arg(self) -> RedisResult<Arg> {
        Ok(Arg::Bytes(self.to_vec()))
    }
}
impl ToArg for Vec<u8> {
    fn to_arg(self) -> RedisResult<Arg> {
        Ok(Arg::Bytes(self))
    }
}
impl<const N: usize> ToArg for &[u8; N] {
    fn to_arg(self) -> RedisResult<Arg> {
        Ok(Arg::Bytes(self.to_vec()))
    }
}
impl ToArg for &str {
    fn to_arg(self) -> RedisResult<Arg> {
        Ok(Arg::Text(self.to_string()))
    }
}
impl ToArg for String {
    fn to_arg(self) -> RedisResult<Arg> {
        Ok(Arg::Text(self))
    }
}
impl ToArg for i64 {
    fn to_arg(self) -> RedisResult<Arg> {
        Ok(Arg::Int(self))
    }
}
impl ToArg for i32 {
    fn to_arg(self) -> RedisResult<Arg> {
        Ok(Arg::Int(i64::from(self)))
    }
}
impl ToArg for u32 {
    fn to_arg(self) -> RedisResult<Arg> {
        Ok(Arg::Int(i64::from(self)))
    }
}
impl ToArg for u64 {
    fn to_arg(self) -> RedisResult<Arg> {
        i64::try_from(self)
            .map(Arg::Int)
            .map_err(|_| RedisError::encode(format!("integer argument {self} out of range")))
    }
}
impl ToArg for usize {
    fn to_arg(self) -> RedisResult<Arg> {
        i64::try_from(self)
            .map(Arg::Int)
            .map_err(|_| RedisError::encode(format!("integer argument {self} out of range")))
    }
}
impl ToArg for f64 {
    fn to_arg(self) -> RedisResult<Arg> {
        if self.is_nan() {
            Err(RedisError::encode("NaN is not a valid command argument"))
        } else {
            Ok(Arg::Float(self))
        }
    }
}
impl ToArg for f32 {
    fn to_arg(self) -> RedisResult<Arg> {
        f64::from(self).to_arg()
    }
}
impl ToArg for bool {
    fn to_arg(self) -> RedisResult<Arg> {
        Err(RedisError::encode(
            "bool is not a valid command argument; choose an explicit representation",
        ))
    }
}
impl From<&[u8]> for Arg {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.to_vec())
    }
}
impl From<Vec<u8>> for Arg {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}
impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}
impl From<String> for Arg {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}
impl From<i64> for Arg {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl<T: ToArg> ToArg for Option<T> {
    fn to_arg(self) -> RedisResult<Arg> {
        match self {
            Some(v) => v.to_arg(),
            None => Err(RedisError::encode(
                "None is not a valid command argument; choose an explicit representation",
            )),
        }
    }
}

/// A command: a name plus a sequence of arguments.
#[derive(Clone, Debug)]
pub struct Command {
    pub(crate) name: String,
    pub(crate) args: Vec<Arg>,
}

impl Command {
    /// Starts a command with the given name.
    #[must_use]
    pub fn new<S: AsRef<str>>(name: S) -> Self {
        Self {
            name: name.as_ref().to_string(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    ///
    /// # Errors
    ///
    /// `RedisError::Encode` if the value has no wire representation.
    pub fn arg<A: ToArg>(mut self, a: A) -> RedisResult<Self> {
        self.args.push(a.to_arg()?);
        Ok(self)
    }

    /// Appends a homogeneous sequence of arguments.
    ///
    /// # Errors
    ///
    /// `RedisError::Encode` if a value has no wire representation.
    pub fn args<A: ToArg, I: IntoIterator<Item = A>>(mut self, args: I) -> RedisResult<Self> {
        for a in args {
            self.args.push(a.to_arg()?);
        }
        Ok(self)
    }

    /// The command name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of arguments (excluding the name).
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }
}

// docu is written at the re-export in lib.rs
#[derive(Clone, Debug, Default)]
pub struct CommandOptions {
    decode: Option<bool>,
    parse_empty_as: Option<Value>,
}

impl CommandOptions {
    /// Returns the per-call override of the connection's auto-decode flag.
    #[must_use]
    pub fn decode(&self) -> Option<bool> {
        self.decode
    }
    /// Builder-method for overriding the connection's auto-decode flag
    /// for this call only. Binary commands should pass `false`.
    #[must_use]
    pub fn with_decode(mut self, decode: bool) -> Self {
        self.decode = Some(decode);
        self
    }

    /// Returns the sentinel that replaces an error reply, if one is set.
    #[must_use]
    pub fn parse_empty_as(&self) -> Option<&Value> {
        self.parse_empty_as.as_ref()
    }
    /// Builder-method for translating a server error reply into the given
    /// sentinel value instead of failing the call.
    #[must_use]
    pub fn with_parse_empty_as(mut self, sentinel: Value) -> Self {
        self.parse_empty_as = Some(sentinel);
        self
    }

    pub(crate) fn take_parse_empty_as(&mut self) -> Option<Value> {
        self.parse_empty_as.take()
    }
}
