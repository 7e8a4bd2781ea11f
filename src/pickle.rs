//! Non-executing decoder for pickle streams (protocols 0 to 5) and the joblib
//! container built on top of them.
//!
//! Nothing named by an artifact is imported or called. Class references are
//! kept as `module.name` pairs, instances keep their constructor arguments
//! and `BUILD` state, and only a handful of pure data constructors (bytes,
//! sets, numpy arrays and scalars) are interpreted.
//!
//! Containers live in an arena so that a memoized list or dict observes the
//! `APPEND`/`SETITEM`/`BUILD` operations applied to it later in the stream.
//!
//! joblib's zlib and gzip compressors are undone with `flate2` before the
//! stream is interpreted.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Read;

use flate2::read::{MultiGzDecoder, ZlibDecoder};

pub type NodeId = usize;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact is empty")]
    Empty,
    #[error("{0}-compressed joblib artifacts are not supported")]
    Compressed(&'static str),
    #[error("failed to decompress {format} artifact: {source}")]
    Decompress {
        format: &'static str,
        source: std::io::Error,
    },
    #[error("unexpected end of data at byte {0}")]
    Truncated(usize),
    #[error("unknown opcode 0x{opcode:02x} at byte {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },
    #[error("unsupported opcode {name} at byte {offset}")]
    UnsupportedOpcode { name: &'static str, offset: usize },
    #[error("stack underflow at byte {0}")]
    StackUnderflow(usize),
    #[error("missing MARK at byte {0}")]
    MissingMark(usize),
    #[error("memo key {0} not found")]
    MissingMemo(usize),
    #[error("malformed pickle at byte {offset}: {message}")]
    Malformed { offset: usize, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    /// Integers wider than 64 bits, kept as decimal digits.
    BigInt(String),
    Float(f64),
    Str(String),
    Node(NodeId),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Bool(value) => Some(i64::from(*value)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRef {
    pub module: String,
    pub name: String,
}

impl ClassRef {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    fn is(&self, module: &str, name: &str) -> bool {
        self.module == module && self.name == name
    }
}

/// An instance whose class was never executed: constructor arguments plus
/// whatever `BUILD`, `APPEND` or `SETITEM` fed into it.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub class: ClassRef,
    pub args: Vec<Value>,
    pub state: Option<Value>,
    pub items: Vec<Value>,
    pub entries: Vec<(Value, Value)>,
}

impl Instance {
    fn new(class: ClassRef, args: Vec<Value>) -> Self {
        Self {
            class,
            args,
            state: None,
            items: Vec::new(),
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayInfo {
    pub shape: Vec<usize>,
    pub dtype: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Bytes { data: Vec<u8>, mutable: bool },
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Set { items: Vec<Value>, frozen: bool },
    Class(ClassRef),
    Instance(Instance),
    Array(ArrayInfo),
}

/// A fully decoded artifact: the node arena plus the value `STOP` returned.
#[derive(Debug, Clone)]
pub struct Artifact {
    nodes: Vec<Node>,
    root: Value,
}

impl Artifact {
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::Empty);
        }
        let data = decompress(data)?;

        let mut interpreter = Interpreter::new(&data);
        let root = interpreter.run()?;
        Ok(Self {
            nodes: interpreter.nodes,
            root,
        })
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, DecodeError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Self::from_bytes(&data)
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_of(&self, value: &Value) -> Option<&Node> {
        match value {
            Value::Node(id) => self.node(*id),
            _ => None,
        }
    }

    /// Looks up a string key in a dict node.
    pub fn dict_get<'a>(&'a self, dict: &'a Value, key: &str) -> Option<&'a Value> {
        match self.node_of(dict)? {
            Node::Dict(entries) => lookup(entries, key),
            _ => None,
        }
    }
}

fn lookup<'a>(entries: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    entries
        .iter()
        .rev()
        .find(|(candidate, _)| candidate.as_str() == Some(key))
        .map(|(_, value)| value)
}

const COMPRESSION_MAGIC: [(&[u8], &str); 7] = [
    (b"ZF", "zlib"),
    (b"\x78", "zlib"),
    (b"\x1f\x8b", "gzip"),
    (b"BZh", "bz2"),
    (b"\xfd7zXZ", "xz"),
    (b"\x5d\x00\x00", "lzma"),
    (b"\x04\x22\x4d\x18", "lz4"),
];

/// Length of the `ZF` header of joblib's pre-0.10 compressed files: the
/// prefix plus the payload length as hex, padded to 19 characters.
const LEGACY_ZFILE_HEADER: usize = 2 + 19;

fn detect_compression(data: &[u8]) -> Option<&'static str> {
    COMPRESSION_MAGIC
        .iter()
        .find(|(magic, _)| data.starts_with(magic))
        .map(|(_, name)| *name)
}

fn decompress(data: &[u8]) -> Result<Cow<'_, [u8]>, DecodeError> {
    let Some(format) = detect_compression(data) else {
        return Ok(Cow::Borrowed(data));
    };

    let mut out = Vec::new();
    let result = if data.starts_with(b"ZF") {
        let body = data.get(LEGACY_ZFILE_HEADER..).ok_or(DecodeError::Truncated(data.len()))?;
        ZlibDecoder::new(body).read_to_end(&mut out)
    } else {
        match format {
            "zlib" => ZlibDecoder::new(data).read_to_end(&mut out),
            "gzip" => MultiGzDecoder::new(data).read_to_end(&mut out),
            other => return Err(DecodeError::Compressed(other)),
        }
    };
    result.map_err(|source| DecodeError::Decompress { format, source })?;

    if out.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(Cow::Owned(out))
}

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const FLOAT: u8 = b'F';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const PERSID: u8 = b'P';
    pub const BINPERSID: u8 = b'Q';
    pub const REDUCE: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const INST: u8 = b'i';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const OBJ: u8 = b'o';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';
    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const EXT1: u8 = 0x82;
    pub const EXT2: u8 = 0x83;
    pub const EXT4: u8 = 0x84;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
    pub const BYTEARRAY8: u8 = 0x96;
    pub const NEXT_BUFFER: u8 = 0x97;
    pub const READONLY_BUFFER: u8 = 0x98;
}

/// Nesting limit for joblib object arrays, each of which opens a new stream.
const MAX_NESTED_STREAMS: usize = 32;

struct Interpreter<'a> {
    data: &'a [u8],
    pos: usize,
    nodes: Vec<Node>,
    nesting: usize,
}

/// Per-stream machine state. joblib nests whole pickle streams for object
/// arrays, so each `run` gets its own.
#[derive(Default)]
struct Frame {
    stack: Vec<Value>,
    marks: Vec<Vec<Value>>,
    memo: HashMap<usize, Value>,
}

impl<'a> Interpreter<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            nodes: Vec::new(),
            nesting: 0,
        }
    }

    fn run(&mut self) -> Result<Value, DecodeError> {
        let mut frame = Frame::default();

        loop {
            let offset = self.pos;
            let opcode = self.read_u8()?;

            match opcode {
                op::STOP => return self.pop(&mut frame, offset),
                op::PROTO => {
                    self.read_u8()?;
                }
                op::FRAME => {
                    self.read_bytes(8)?;
                }
                op::MARK => frame.marks.push(std::mem::take(&mut frame.stack)),
                op::POP => {
                    if frame.stack.is_empty() {
                        self.pop_mark(&mut frame, offset)?;
                    } else {
                        frame.stack.pop();
                    }
                }
                op::POP_MARK => {
                    self.pop_mark(&mut frame, offset)?;
                }
                op::DUP => {
                    let top = frame
                        .stack
                        .last()
                        .cloned()
                        .ok_or(DecodeError::StackUnderflow(offset))?;
                    frame.stack.push(top);
                }

                op::NONE => frame.stack.push(Value::None),
                op::NEWTRUE => frame.stack.push(Value::Bool(true)),
                op::NEWFALSE => frame.stack.push(Value::Bool(false)),
                op::INT => {
                    let line = self.read_line()?;
                    let value = match line {
                        b"00" => Value::Bool(false),
                        b"01" => Value::Bool(true),
                        digits => parse_decimal(digits, offset)?,
                    };
                    frame.stack.push(value);
                }
                op::LONG => {
                    let line = self.read_line()?;
                    let digits = line.strip_suffix(b"L").unwrap_or(line);
                    frame.stack.push(parse_decimal(digits, offset)?);
                }
                op::BININT => {
                    let value = i32::from_le_bytes(self.read_array()?);
                    frame.stack.push(Value::Int(i64::from(value)));
                }
                op::BININT1 => {
                    let value = self.read_u8()?;
                    frame.stack.push(Value::Int(i64::from(value)));
                }
                op::BININT2 => {
                    let value = u16::from_le_bytes(self.read_array()?);
                    frame.stack.push(Value::Int(i64::from(value)));
                }
                op::LONG1 => {
                    let len = usize::from(self.read_u8()?);
                    let bytes = self.read_bytes(len)?;
                    frame.stack.push(decode_long(bytes));
                }
                op::LONG4 => {
                    let len = self.read_len_i32(offset)?;
                    let bytes = self.read_bytes(len)?;
                    frame.stack.push(decode_long(bytes));
                }
                op::FLOAT => {
                    let line = self.read_line()?;
                    let value = std::str::from_utf8(line)
                        .ok()
                        .and_then(|text| text.trim().parse::<f64>().ok())
                        .ok_or_else(|| malformed(offset, "invalid FLOAT literal"))?;
                    frame.stack.push(Value::Float(value));
                }
                op::BINFLOAT => {
                    let value = f64::from_be_bytes(self.read_array()?);
                    frame.stack.push(Value::Float(value));
                }

                op::STRING => {
                    let line = self.read_line()?;
                    let text = decode_quoted(line).ok_or_else(|| malformed(offset, "invalid STRING literal"))?;
                    frame.stack.push(Value::Str(text));
                }
                op::BINSTRING => {
                    let len = self.read_len_i32(offset)?;
                    let bytes = self.read_bytes(len)?;
                    frame.stack.push(Value::Str(latin1(bytes)));
                }
                op::SHORT_BINSTRING => {
                    let len = usize::from(self.read_u8()?);
                    let bytes = self.read_bytes(len)?;
                    frame.stack.push(Value::Str(latin1(bytes)));
                }
                op::UNICODE => {
                    let line = self.read_line()?;
                    frame.stack.push(Value::Str(decode_raw_unicode_escape(line)));
                }
                op::BINUNICODE => {
                    let len = self.read_len_u32()?;
                    let text = self.read_utf8(len)?;
                    frame.stack.push(Value::Str(text));
                }
                op::SHORT_BINUNICODE => {
                    let len = usize::from(self.read_u8()?);
                    let text = self.read_utf8(len)?;
                    frame.stack.push(Value::Str(text));
                }
                op::BINUNICODE8 => {
                    let len = self.read_len_u64(offset)?;
                    let text = self.read_utf8(len)?;
                    frame.stack.push(Value::Str(text));
                }
                op::BINBYTES => {
                    let len = self.read_len_u32()?;
                    let value = self.bytes_node(len, false)?;
                    frame.stack.push(value);
                }
                op::SHORT_BINBYTES => {
                    let len = usize::from(self.read_u8()?);
                    let value = self.bytes_node(len, false)?;
                    frame.stack.push(value);
                }
                op::BINBYTES8 => {
                    let len = self.read_len_u64(offset)?;
                    let value = self.bytes_node(len, false)?;
                    frame.stack.push(value);
                }
                op::BYTEARRAY8 => {
                    let len = self.read_len_u64(offset)?;
                    let value = self.bytes_node(len, true)?;
                    frame.stack.push(value);
                }

                op::EMPTY_LIST => {
                    let value = self.alloc(Node::List(Vec::new()));
                    frame.stack.push(value);
                }
                op::LIST => {
                    let items = self.pop_mark(&mut frame, offset)?;
                    let value = self.alloc(Node::List(items));
                    frame.stack.push(value);
                }
                op::APPEND => {
                    let item = self.pop(&mut frame, offset)?;
                    self.extend_items(&frame, vec![item], offset)?;
                }
                op::APPENDS => {
                    let items = self.pop_mark(&mut frame, offset)?;
                    self.extend_items(&frame, items, offset)?;
                }
                op::EMPTY_TUPLE => {
                    let value = self.alloc(Node::Tuple(Vec::new()));
                    frame.stack.push(value);
                }
                op::TUPLE => {
                    let items = self.pop_mark(&mut frame, offset)?;
                    let value = self.alloc(Node::Tuple(items));
                    frame.stack.push(value);
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let count = usize::from(opcode - op::TUPLE1 + 1);
                    if frame.stack.len() < count {
                        return Err(DecodeError::StackUnderflow(offset));
                    }
                    let items = frame.stack.split_off(frame.stack.len() - count);
                    let value = self.alloc(Node::Tuple(items));
                    frame.stack.push(value);
                }
                op::EMPTY_DICT => {
                    let value = self.alloc(Node::Dict(Vec::new()));
                    frame.stack.push(value);
                }
                op::DICT => {
                    let items = self.pop_mark(&mut frame, offset)?;
                    let entries = pairs(items, offset)?;
                    let value = self.alloc(Node::Dict(entries));
                    frame.stack.push(value);
                }
                op::SETITEM => {
                    let value = self.pop(&mut frame, offset)?;
                    let key = self.pop(&mut frame, offset)?;
                    self.extend_entries(&frame, vec![(key, value)], offset)?;
                }
                op::SETITEMS => {
                    let items = self.pop_mark(&mut frame, offset)?;
                    let entries = pairs(items, offset)?;
                    self.extend_entries(&frame, entries, offset)?;
                }
                op::EMPTY_SET => {
                    let value = self.alloc(Node::Set {
                        items: Vec::new(),
                        frozen: false,
                    });
                    frame.stack.push(value);
                }
                op::ADDITEMS => {
                    let items = self.pop_mark(&mut frame, offset)?;
                    let target = self.top_node(&frame, offset)?;
                    match &mut self.nodes[target] {
                        Node::Set { items: set, .. } => set.extend(items),
                        _ => return Err(malformed(offset, "ADDITEMS target is not a set")),
                    }
                }
                op::FROZENSET => {
                    let items = self.pop_mark(&mut frame, offset)?;
                    let value = self.alloc(Node::Set { items, frozen: true });
                    frame.stack.push(value);
                }

                op::GET => {
                    let key = self.read_line_index(offset)?;
                    let value = memo_get(&frame, key)?;
                    frame.stack.push(value);
                }
                op::BINGET => {
                    let key = usize::from(self.read_u8()?);
                    let value = memo_get(&frame, key)?;
                    frame.stack.push(value);
                }
                op::LONG_BINGET => {
                    let key = self.read_len_u32()?;
                    let value = memo_get(&frame, key)?;
                    frame.stack.push(value);
                }
                op::PUT => {
                    let key = self.read_line_index(offset)?;
                    memo_put(&mut frame, key, offset)?;
                }
                op::BINPUT => {
                    let key = usize::from(self.read_u8()?);
                    memo_put(&mut frame, key, offset)?;
                }
                op::LONG_BINPUT => {
                    let key = self.read_len_u32()?;
                    memo_put(&mut frame, key, offset)?;
                }
                op::MEMOIZE => {
                    let key = frame.memo.len();
                    memo_put(&mut frame, key, offset)?;
                }

                op::GLOBAL => {
                    let module = latin1(self.read_line()?);
                    let name = latin1(self.read_line()?);
                    let value = self.alloc(Node::Class(fix_import(module, name)));
                    frame.stack.push(value);
                }
                op::STACK_GLOBAL => {
                    let name = self.pop(&mut frame, offset)?;
                    let module = self.pop(&mut frame, offset)?;
                    let (Value::Str(module), Value::Str(name)) = (module, name) else {
                        return Err(malformed(offset, "STACK_GLOBAL expects two strings"));
                    };
                    let value = self.alloc(Node::Class(fix_import(module, name)));
                    frame.stack.push(value);
                }
                op::REDUCE => {
                    let args = self.pop(&mut frame, offset)?;
                    let callable = self.pop(&mut frame, offset)?;
                    let value = self.reduce(&callable, &args, offset)?;
                    frame.stack.push(value);
                }
                op::BUILD => {
                    let state = self.pop(&mut frame, offset)?;
                    let target = self.top_node(&frame, offset)?;
                    self.build(target, state, offset)?;
                }
                op::INST => {
                    let module = latin1(self.read_line()?);
                    let name = latin1(self.read_line()?);
                    let args = self.pop_mark(&mut frame, offset)?;
                    let value = self.alloc(Node::Instance(Instance::new(fix_import(module, name), args)));
                    frame.stack.push(value);
                }
                op::OBJ => {
                    let mut items = self.pop_mark(&mut frame, offset)?;
                    if items.is_empty() {
                        return Err(DecodeError::StackUnderflow(offset));
                    }
                    let class = self.class_of(&items.remove(0), offset)?;
                    let value = self.alloc(Node::Instance(Instance::new(class, items)));
                    frame.stack.push(value);
                }
                op::NEWOBJ => {
                    let args = self.pop(&mut frame, offset)?;
                    let class = self.pop(&mut frame, offset)?;
                    let value = self.new_instance(&class, &args, offset)?;
                    frame.stack.push(value);
                }
                op::NEWOBJ_EX => {
                    let _kwargs = self.pop(&mut frame, offset)?;
                    let args = self.pop(&mut frame, offset)?;
                    let class = self.pop(&mut frame, offset)?;
                    let value = self.new_instance(&class, &args, offset)?;
                    frame.stack.push(value);
                }

                op::PERSID => return Err(unsupported("PERSID", offset)),
                op::BINPERSID => return Err(unsupported("BINPERSID", offset)),
                op::EXT1 => return Err(unsupported("EXT1", offset)),
                op::EXT2 => return Err(unsupported("EXT2", offset)),
                op::EXT4 => return Err(unsupported("EXT4", offset)),
                op::NEXT_BUFFER => return Err(unsupported("NEXT_BUFFER", offset)),
                op::READONLY_BUFFER => return Err(unsupported("READONLY_BUFFER", offset)),

                opcode => return Err(DecodeError::UnknownOpcode { opcode, offset }),
            }
        }
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let data: &'a [u8] = self.data;
        let byte = *data.get(self.pos).ok_or(DecodeError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let data: &'a [u8] = self.data;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or(DecodeError::Truncated(data.len()))?;
        let bytes = &data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn read_len_u32(&mut self) -> Result<usize, DecodeError> {
        let len = u32::from_le_bytes(self.read_array()?);
        Ok(len as usize)
    }

    fn read_len_i32(&mut self, offset: usize) -> Result<usize, DecodeError> {
        let len = i32::from_le_bytes(self.read_array()?);
        usize::try_from(len).map_err(|_| malformed(offset, "negative length"))
    }

    fn read_len_u64(&mut self, offset: usize) -> Result<usize, DecodeError> {
        let len = u64::from_le_bytes(self.read_array()?);
        usize::try_from(len).map_err(|_| malformed(offset, "length does not fit in memory"))
    }

    fn read_line(&mut self) -> Result<&'a [u8], DecodeError> {
        let data: &'a [u8] = self.data;
        let rest = &data[self.pos..];
        let newline = rest
            .iter()
            .position(|byte| *byte == b'\n')
            .ok_or(DecodeError::Truncated(data.len()))?;
        self.pos += newline + 1;
        let line = &rest[..newline];
        Ok(line.strip_suffix(b"\r").unwrap_or(line))
    }

    fn read_line_index(&mut self, offset: usize) -> Result<usize, DecodeError> {
        let line = self.read_line()?;
        std::str::from_utf8(line)
            .ok()
            .and_then(|text| text.trim().parse::<usize>().ok())
            .ok_or_else(|| malformed(offset, "invalid memo index"))
    }

    fn read_utf8(&mut self, len: usize) -> Result<String, DecodeError> {
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn bytes_node(&mut self, len: usize, mutable: bool) -> Result<Value, DecodeError> {
        let data = self.read_bytes(len)?.to_vec();
        Ok(self.alloc(Node::Bytes { data, mutable }))
    }

    fn alloc(&mut self, node: Node) -> Value {
        self.nodes.push(node);
        Value::Node(self.nodes.len() - 1)
    }

    fn pop(&self, frame: &mut Frame, offset: usize) -> Result<Value, DecodeError> {
        frame.stack.pop().ok_or(DecodeError::StackUnderflow(offset))
    }

    fn pop_mark(&self, frame: &mut Frame, offset: usize) -> Result<Vec<Value>, DecodeError> {
        let previous = frame.marks.pop().ok_or(DecodeError::MissingMark(offset))?;
        Ok(std::mem::replace(&mut frame.stack, previous))
    }

    fn top_node(&self, frame: &Frame, offset: usize) -> Result<NodeId, DecodeError> {
        match frame.stack.last() {
            Some(Value::Node(id)) => Ok(*id),
            Some(_) => Err(malformed(offset, "operation target is not a container")),
            None => Err(DecodeError::StackUnderflow(offset)),
        }
    }

    fn extend_items(&mut self, frame: &Frame, items: Vec<Value>, offset: usize) -> Result<(), DecodeError> {
        let target = self.top_node(frame, offset)?;
        match &mut self.nodes[target] {
            Node::List(list) => list.extend(items),
            Node::Instance(instance) => instance.items.extend(items),
            _ => return Err(malformed(offset, "APPEND target is not a list")),
        }
        Ok(())
    }

    fn extend_entries(
        &mut self,
        frame: &Frame,
        entries: Vec<(Value, Value)>,
        offset: usize,
    ) -> Result<(), DecodeError> {
        let target = self.top_node(frame, offset)?;
        match &mut self.nodes[target] {
            Node::Dict(dict) => dict.extend(entries),
            Node::Instance(instance) => instance.entries.extend(entries),
            _ => return Err(malformed(offset, "SETITEM target is not a dict")),
        }
        Ok(())
    }

    fn node(&self, value: &Value) -> Option<&Node> {
        match value {
            Value::Node(id) => self.nodes.get(*id),
            _ => None,
        }
    }

    fn class_of(&self, value: &Value, offset: usize) -> Result<ClassRef, DecodeError> {
        match self.node(value) {
            Some(Node::Class(class)) => Ok(class.clone()),
            _ => Err(malformed(offset, "expected a class reference")),
        }
    }

    fn tuple_items(&self, value: &Value, offset: usize) -> Result<Vec<Value>, DecodeError> {
        match self.node(value) {
            Some(Node::Tuple(items)) => Ok(items.clone()),
            _ => Err(malformed(offset, "expected an argument tuple")),
        }
    }

    fn bytes_of(&self, value: &Value) -> Option<Vec<u8>> {
        match (value, self.node(value)) {
            (_, Some(Node::Bytes { data, .. })) => Some(data.clone()),
            (Value::Str(text), _) => Some(text.chars().map(|ch| ch as u32 as u8).collect()),
            _ => None,
        }
    }

    fn new_instance(&mut self, class: &Value, args: &Value, offset: usize) -> Result<Value, DecodeError> {
        let class = self.class_of(class, offset)?;
        let args = self.tuple_items(args, offset)?;
        Ok(self.alloc(Node::Instance(Instance::new(class, args))))
    }

    /// Interprets `callable(*args)` for the known data constructors and
    /// records everything else as an opaque instance.
    fn reduce(&mut self, callable: &Value, args: &Value, offset: usize) -> Result<Value, DecodeError> {
        let class = self.class_of(callable, offset)?;
        let args = self.tuple_items(args, offset)?;

        let value = match (class.module.as_str(), class.name.as_str()) {
            ("copyreg", "_reconstructor") | ("copyreg", "__newobj__") | ("copyreg", "__newobj_ex__") => {
                let target = args.first().ok_or_else(|| malformed(offset, "missing class argument"))?;
                let target = self.class_of(target, offset)?;
                let rest = if class.name == "_reconstructor" { Vec::new() } else { args[1..].to_vec() };
                self.alloc(Node::Instance(Instance::new(target, rest)))
            }
            ("builtins", "bytearray") | ("builtins", "bytes") | ("_codecs", "encode") => {
                let data = match args.first() {
                    Some(arg) => self.bytes_of(arg).ok_or_else(|| malformed(offset, "invalid bytes argument"))?,
                    None => Vec::new(),
                };
                let mutable = class.name == "bytearray";
                self.alloc(Node::Bytes { data, mutable })
            }
            ("builtins", "set") | ("builtins", "frozenset") => {
                let items = match args.first().and_then(|arg| self.node(arg)) {
                    Some(Node::List(items)) | Some(Node::Tuple(items)) => items.clone(),
                    _ => Vec::new(),
                };
                let frozen = class.name == "frozenset";
                self.alloc(Node::Set { items, frozen })
            }
            ("collections", "OrderedDict") | ("collections", "defaultdict") => {
                self.alloc(Node::Dict(Vec::new()))
            }
            (module, "_reconstruct") if is_numpy_multiarray(module) => {
                let array_class = match args.first() {
                    Some(arg) => self.class_of(arg, offset)?,
                    None => ClassRef::new("numpy", "ndarray"),
                };
                self.alloc(Node::Instance(Instance::new(array_class, Vec::new())))
            }
            (module, "scalar") if is_numpy_multiarray(module) => self.numpy_scalar(&args),
            _ => self.alloc(Node::Instance(Instance::new(class, args))),
        };
        Ok(value)
    }

    fn numpy_scalar(&mut self, args: &[Value]) -> Value {
        let dtype = args.first().and_then(|dtype| self.dtype_descr(dtype));
        let data = args.get(1).and_then(|data| self.bytes_of(data));

        if let (Some(dtype), Some(data)) = (&dtype, &data) {
            if let Some(value) = decode_scalar(dtype, data) {
                return value;
            }
        }

        let name = dtype.map(|dtype| dtype_name(&dtype.code)).unwrap_or_else(|| "generic".to_string());
        self.alloc(Node::Instance(Instance::new(ClassRef::new("numpy", name), Vec::new())))
    }

    fn dtype_descr(&self, value: &Value) -> Option<DtypeDescr> {
        let Some(Node::Instance(instance)) = self.node(value) else {
            return None;
        };
        if !instance.class.is("numpy", "dtype") {
            return None;
        }
        let code = instance.args.first()?.as_str()?.to_string();
        let big_endian = match instance.state.as_ref().and_then(|state| self.node(state)) {
            Some(Node::Tuple(items)) => items.get(1).and_then(Value::as_str) == Some(">"),
            _ => false,
        };
        Some(DtypeDescr { code, big_endian })
    }

    fn build(&mut self, target: NodeId, state: Value, offset: usize) -> Result<(), DecodeError> {
        let class = match &self.nodes[target] {
            Node::Instance(instance) => Some(instance.class.clone()),
            Node::Dict(_) => None,
            _ => return Err(malformed(offset, "BUILD target is not an object")),
        };
        let Some(class) = class else {
            if let Some(Node::Dict(entries)) = self.node(&state).cloned() {
                if let Node::Dict(dict) = &mut self.nodes[target] {
                    dict.extend(entries);
                }
            }
            return Ok(());
        };

        if is_joblib_wrapper(&class) {
            return self.read_joblib_array(target, &state, offset);
        }
        if class.is("numpy", "ndarray") {
            if let Some(array) = self.ndarray_state(&state) {
                self.nodes[target] = Node::Array(array);
                return Ok(());
            }
        }

        let state = self.merge_slot_state(state);
        if let Node::Instance(instance) = &mut self.nodes[target] {
            instance.state = Some(state);
        }
        Ok(())
    }

    /// `(dict, slots)` state tuples are flattened into one dict.
    fn merge_slot_state(&mut self, state: Value) -> Value {
        let Some(Node::Tuple(items)) = self.node(&state) else {
            return state;
        };
        if items.len() != 2 {
            return state;
        }

        let mut merged = Vec::new();
        for part in items.iter() {
            match self.node(part) {
                Some(Node::Dict(entries)) => merged.extend(entries.iter().cloned()),
                None if *part == Value::None => {}
                _ => return state,
            }
        }
        self.alloc(Node::Dict(merged))
    }

    fn ndarray_state(&self, state: &Value) -> Option<ArrayInfo> {
        let Some(Node::Tuple(items)) = self.node(state) else {
            return None;
        };
        if items.len() < 4 {
            return None;
        }
        let shape = self.shape_of(&items[1])?;
        let dtype = self.dtype_descr(&items[2])?;
        Some(ArrayInfo {
            shape,
            dtype: dtype_name(&dtype.code),
        })
    }

    fn shape_of(&self, value: &Value) -> Option<Vec<usize>> {
        let Some(Node::Tuple(dims)) = self.node(value) else {
            return None;
        };
        dims.iter()
            .map(|dim| dim.as_int().and_then(|dim| usize::try_from(dim).ok()))
            .collect()
    }

    /// joblib writes each array's raw buffer right after the wrapper's
    /// `BUILD` opcode; object arrays get a nested pickle stream instead.
    fn read_joblib_array(&mut self, target: NodeId, state: &Value, offset: usize) -> Result<(), DecodeError> {
        let Some(Node::Dict(entries)) = self.node(state).cloned() else {
            return Err(malformed(offset, "array wrapper state is not a dict"));
        };
        let shape = lookup(&entries, "shape")
            .and_then(|shape| self.shape_of(shape))
            .ok_or_else(|| malformed(offset, "array wrapper has no shape"))?;
        let dtype = lookup(&entries, "dtype")
            .and_then(|dtype| self.dtype_descr(dtype))
            .ok_or_else(|| malformed(offset, "array wrapper has no dtype"))?;

        let array = if dtype.code.starts_with('O') {
            if self.nesting >= MAX_NESTED_STREAMS {
                return Err(malformed(offset, "object arrays are nested too deeply"));
            }
            self.nesting += 1;
            let nested = self.run();
            self.nesting -= 1;
            let nested = nested?;
            match self.node(&nested) {
                Some(Node::Array(array)) => array.clone(),
                _ => ArrayInfo {
                    shape,
                    dtype: dtype_name(&dtype.code),
                },
            }
        } else {
            if let Some(Value::Int(_)) = lookup(&entries, "numpy_array_alignment_bytes") {
                let padding = usize::from(self.read_u8()?);
                self.read_bytes(padding)?;
            }
            let itemsize = dtype_itemsize(&dtype.code)
                .ok_or_else(|| malformed(offset, format!("unsupported dtype {}", dtype.code)))?;
            let len = shape
                .iter()
                .try_fold(itemsize, |acc, dim| acc.checked_mul(*dim))
                .ok_or_else(|| malformed(offset, "array size overflows"))?;
            self.read_bytes(len)?;
            ArrayInfo {
                shape,
                dtype: dtype_name(&dtype.code),
            }
        };

        self.nodes[target] = Node::Array(array);
        Ok(())
    }
}

struct DtypeDescr {
    code: String,
    big_endian: bool,
}

fn memo_get(frame: &Frame, key: usize) -> Result<Value, DecodeError> {
    frame.memo.get(&key).cloned().ok_or(DecodeError::MissingMemo(key))
}

fn memo_put(frame: &mut Frame, key: usize, offset: usize) -> Result<(), DecodeError> {
    let top = frame.stack.last().cloned().ok_or(DecodeError::StackUnderflow(offset))?;
    frame.memo.insert(key, top);
    Ok(())
}

fn pairs(items: Vec<Value>, offset: usize) -> Result<Vec<(Value, Value)>, DecodeError> {
    if items.len() % 2 != 0 {
        return Err(malformed(offset, "odd number of items for a dict"));
    }
    let mut entries = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        entries.push((key, value));
    }
    Ok(entries)
}

fn malformed(offset: usize, message: impl Into<String>) -> DecodeError {
    DecodeError::Malformed {
        offset,
        message: message.into(),
    }
}

fn unsupported(name: &'static str, offset: usize) -> DecodeError {
    DecodeError::UnsupportedOpcode { name, offset }
}

/// Protocol 0-2 pickles written by Python 2 name a few modules differently.
fn fix_import(module: String, name: String) -> ClassRef {
    let module = match module.as_str() {
        "__builtin__" => "builtins".to_string(),
        "copy_reg" => "copyreg".to_string(),
        _ => module,
    };
    ClassRef { module, name }
}

fn is_numpy_multiarray(module: &str) -> bool {
    module == "numpy.core.multiarray" || module == "numpy._core.multiarray"
}

fn is_joblib_wrapper(class: &ClassRef) -> bool {
    class.name == "NumpyArrayWrapper" && class.module.ends_with("numpy_pickle")
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| char::from(*byte)).collect()
}

fn parse_decimal(digits: &[u8], offset: usize) -> Result<Value, DecodeError> {
    let text = std::str::from_utf8(digits)
        .map_err(|_| malformed(offset, "invalid integer literal"))?
        .trim();
    if let Ok(value) = text.parse::<i64>() {
        return Ok(Value::Int(value));
    }
    let unsigned = text.strip_prefix('-').unwrap_or(text);
    if !unsigned.is_empty() && unsigned.bytes().all(|byte| byte.is_ascii_digit()) {
        Ok(Value::BigInt(text.to_string()))
    } else {
        Err(malformed(offset, "invalid integer literal"))
    }
}

/// Little-endian two's complement, as written by LONG1/LONG4.
fn decode_long(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Int(0);
    }
    let negative = bytes[bytes.len() - 1] & 0x80 != 0;
    if bytes.len() <= 8 {
        let fill = if negative { 0xff } else { 0x00 };
        let mut buf = [fill; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        return Value::Int(i64::from_le_bytes(buf));
    }

    let mut magnitude = bytes.to_vec();
    if negative {
        // two's complement negation: invert, then add one
        let mut carry = true;
        for byte in magnitude.iter_mut() {
            *byte = !*byte;
            if carry {
                let (sum, overflow) = byte.overflowing_add(1);
                *byte = sum;
                carry = overflow;
            }
        }
    }

    let digits = magnitude_to_decimal(magnitude);
    Value::BigInt(if negative { format!("-{digits}") } else { digits })
}

fn magnitude_to_decimal(mut le_bytes: Vec<u8>) -> String {
    let mut digits = Vec::new();
    while le_bytes.iter().any(|byte| *byte != 0) {
        let mut remainder = 0u32;
        for byte in le_bytes.iter_mut().rev() {
            let current = (remainder << 8) | u32::from(*byte);
            *byte = (current / 10) as u8;
            remainder = current % 10;
        }
        digits.push(char::from(b'0' + remainder as u8));
    }
    if digits.is_empty() {
        return "0".to_string();
    }
    digits.iter().rev().collect()
}

/// Decodes a protocol 0 `STRING` argument: a quoted literal with escapes.
fn decode_quoted(line: &[u8]) -> Option<String> {
    let (&first, rest) = line.split_first()?;
    let (&last, body) = rest.split_last()?;
    if first != last || (first != b'\'' && first != b'"') {
        return None;
    }

    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.iter().copied();
    while let Some(byte) = iter.next() {
        if byte != b'\\' {
            out.push(byte);
            continue;
        }
        match iter.next()? {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'0' => out.push(0),
            b'x' => {
                let high = hex_value(iter.next()?)?;
                let low = hex_value(iter.next()?)?;
                out.push(high << 4 | low);
            }
            other => out.push(other),
        }
    }
    Some(latin1(&out))
}

/// Decodes a protocol 0 `UNICODE` argument (`raw-unicode-escape`).
fn decode_raw_unicode_escape(line: &[u8]) -> String {
    let mut out = String::with_capacity(line.len());
    let mut index = 0;
    while index < line.len() {
        let byte = line[index];
        if byte == b'\\' && index + 1 < line.len() {
            let width = match line[index + 1] {
                b'u' => 4,
                b'U' => 8,
                _ => 0,
            };
            let digits = line.get(index + 2..index + 2 + width);
            if let Some(ch) = digits
                .filter(|_| width > 0)
                .and_then(|digits| std::str::from_utf8(digits).ok())
                .and_then(|digits| u32::from_str_radix(digits, 16).ok())
                .and_then(char::from_u32)
            {
                out.push(ch);
                index += 2 + width;
                continue;
            }
        }
        out.push(char::from(byte));
        index += 1;
    }
    out
}

fn hex_value(byte: u8) -> Option<u8> {
    char::from(byte).to_digit(16).map(|digit| digit as u8)
}

const BYTE_ORDER_MARKS: &[char] = &['<', '>', '|', '='];

fn dtype_kind(code: &str) -> (char, Option<usize>) {
    let code = code.trim_start_matches(BYTE_ORDER_MARKS);
    let mut chars = code.chars();
    let kind = chars.next().unwrap_or('?');
    let size = chars.as_str().parse::<usize>().ok();
    (kind, size)
}

fn dtype_itemsize(code: &str) -> Option<usize> {
    match dtype_kind(code) {
        ('U', Some(len)) => len.checked_mul(4),
        ('M' | 'm', _) => Some(8),
        (_, size) => size,
    }
}

/// numpy's spelling of a dtype code (`f8` is `float64`).
pub fn dtype_name(code: &str) -> String {
    let (kind, size) = dtype_kind(code);
    let bits = size.map(|size| size * 8);
    match (kind, bits) {
        ('f', Some(bits)) => format!("float{bits}"),
        ('i', Some(bits)) => format!("int{bits}"),
        ('u', Some(bits)) => format!("uint{bits}"),
        ('c', Some(bits)) => format!("complex{bits}"),
        ('b', _) => "bool".to_string(),
        ('O', _) => "object".to_string(),
        ('U', Some(_)) | ('S', Some(_)) => format!("<{}", code.trim_start_matches(BYTE_ORDER_MARKS)),
        _ => code.to_string(),
    }
}

fn decode_scalar(dtype: &DtypeDescr, data: &[u8]) -> Option<Value> {
    fn fixed<const N: usize>(data: &[u8], big_endian: bool) -> Option<[u8; N]> {
        let mut buf: [u8; N] = data.get(..N)?.try_into().ok()?;
        if big_endian {
            buf.reverse();
        }
        Some(buf)
    }

    let be = dtype.big_endian;
    let value = match dtype_kind(&dtype.code) {
        ('f', Some(8)) => Value::Float(f64::from_le_bytes(fixed(data, be)?)),
        ('f', Some(4)) => Value::Float(f64::from(f32::from_le_bytes(fixed(data, be)?))),
        ('i', Some(8)) => Value::Int(i64::from_le_bytes(fixed(data, be)?)),
        ('i', Some(4)) => Value::Int(i64::from(i32::from_le_bytes(fixed(data, be)?))),
        ('i', Some(2)) => Value::Int(i64::from(i16::from_le_bytes(fixed(data, be)?))),
        ('i', Some(1)) => Value::Int(i64::from(i8::from_le_bytes(fixed(data, be)?))),
        ('u', Some(4)) => Value::Int(i64::from(u32::from_le_bytes(fixed(data, be)?))),
        ('u', Some(2)) => Value::Int(i64::from(u16::from_le_bytes(fixed(data, be)?))),
        ('u', Some(1)) => Value::Int(i64::from(*data.first()?)),
        ('b', _) => Value::Bool(*data.first()? != 0),
        _ => return None,
    };
    Some(value)
}
