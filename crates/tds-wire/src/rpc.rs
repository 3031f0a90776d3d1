//! RPC (Remote Procedure Call) request encoding.
//!
//! Parameterized commands are sent as an RPC request (packet type 0x03) to
//! `sp_executesql`, addressed by its well-known procedure id.
//!
//! ```text
//! +-------------------+
//! | ALL_HEADERS       |
//! +-------------------+
//! | 0xFFFF + ProcID   |
//! +-------------------+
//! | Option flags      | (2 bytes)
//! +-------------------+
//! | Parameters        | (repeated: name, status, TYPE_INFO, value)
//! +-------------------+
//! ```

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{utf16_byte_len, write_b_varchar, write_utf16_string};
use crate::error::ProtocolError;
use crate::sql_batch::{ALL_HEADERS_SIZE, write_all_headers};
use crate::types::{COLLATION_SIZE, MAX_TYPE_LENGTH, PLP_NULL, TypeId};

/// Default collation sent with character parameters.
const DEFAULT_COLLATION: [u8; COLLATION_SIZE] = [0x09, 0x04, 0xD0, 0x00, 0x34];

/// Longest non-MAX `nvarchar`, in characters.
const MAX_NVARCHAR_CHARS: usize = 4000;

/// Longest non-MAX `varbinary`, in bytes.
const MAX_VARBINARY_BYTES: usize = 8000;

/// Well-known stored procedure ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProcId {
    /// sp_executesql
    ExecuteSql = 0x000A,
    /// sp_prepare
    Prepare = 0x000B,
    /// sp_execute
    Execute = 0x000C,
    /// sp_prepexec
    PrepExec = 0x000D,
    /// sp_unprepare
    Unprepare = 0x000F,
}

bitflags! {
    /// RPC option flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct RpcOptions: u16 {
        /// Recompile the procedure.
        const WITH_RECOMPILE = 0x0001;
        /// Do not send metadata in the response.
        const NO_METADATA = 0x0002;
        /// Reuse metadata from the previous call.
        const REUSE_METADATA = 0x0004;
    }
}

bitflags! {
    /// RPC parameter status flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ParamFlags: u8 {
        /// OUTPUT parameter.
        const BY_REF = 0x01;
        /// Use the parameter's default value.
        const DEFAULT = 0x02;
    }
}

/// Declared type of an RPC parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInfo {
    /// Wire type.
    pub type_id: TypeId,
    /// Declared maximum length in bytes, [`MAX_TYPE_LENGTH`] for `(MAX)`.
    pub max_length: u16,
}

impl TypeInfo {
    /// `int`
    #[must_use]
    pub const fn int() -> Self {
        Self::new(TypeId::IntN, 4)
    }

    /// `bigint`
    #[must_use]
    pub const fn bigint() -> Self {
        Self::new(TypeId::IntN, 8)
    }

    /// `bit`
    #[must_use]
    pub const fn bit() -> Self {
        Self::new(TypeId::BitN, 1)
    }

    /// `float`
    #[must_use]
    pub const fn float() -> Self {
        Self::new(TypeId::FloatN, 8)
    }

    /// `nvarchar(chars)`, or `nvarchar(max)` when `chars` exceeds 4000.
    #[must_use]
    pub fn nvarchar(chars: usize) -> Self {
        if chars > MAX_NVARCHAR_CHARS {
            Self::new(TypeId::NVarChar, MAX_TYPE_LENGTH)
        } else {
            // Bounded by 4000 above, so the byte length fits.
            Self::new(TypeId::NVarChar, (chars.max(1) * 2) as u16)
        }
    }

    /// `varbinary(len)`, or `varbinary(max)` when `len` exceeds 8000.
    #[must_use]
    pub fn varbinary(len: usize) -> Self {
        if len > MAX_VARBINARY_BYTES {
            Self::new(TypeId::BigVarBinary, MAX_TYPE_LENGTH)
        } else {
            Self::new(TypeId::BigVarBinary, len.max(1) as u16)
        }
    }

    const fn new(type_id: TypeId, max_length: u16) -> Self {
        Self {
            type_id,
            max_length,
        }
    }

    /// Whether values are sent partially length prefixed.
    #[must_use]
    pub const fn is_max(&self) -> bool {
        self.max_length == MAX_TYPE_LENGTH
    }

    /// The type as written in an `sp_executesql` parameter declaration.
    #[must_use]
    pub fn sql_name(&self) -> String {
        match (self.type_id, self.max_length) {
            (TypeId::IntN, 8) => "bigint".into(),
            (TypeId::IntN, _) => "int".into(),
            (TypeId::BitN, _) => "bit".into(),
            (TypeId::FloatN, _) => "float".into(),
            (TypeId::NVarChar, _) if self.is_max() => "nvarchar(max)".into(),
            (TypeId::NVarChar, len) => format!("nvarchar({})", len / 2),
            (TypeId::BigVarBinary, _) if self.is_max() => "varbinary(max)".into(),
            (TypeId::BigVarBinary, len) => format!("varbinary({len})"),
            _ => "sql_variant".into(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.type_id as u8);
        match self.type_id {
            TypeId::NVarChar => {
                buf.put_u16_le(self.max_length);
                buf.put_slice(&DEFAULT_COLLATION);
            }
            TypeId::BigVarBinary => buf.put_u16_le(self.max_length),
            // Bounded by the constructors to a single byte.
            _ => buf.put_u8(self.max_length as u8),
        }
    }
}

/// One RPC parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcParam {
    /// Parameter name including the `@`, empty for positional parameters.
    pub name: String,
    /// Status flags.
    pub flags: ParamFlags,
    /// Declared type.
    pub type_info: TypeInfo,
    /// Encoded value, `None` for NULL.
    pub value: Option<Bytes>,
}

impl RpcParam {
    /// Parameter with an already encoded value.
    pub fn new(name: impl Into<String>, type_info: TypeInfo, value: Bytes) -> Self {
        Self {
            name: name.into(),
            flags: ParamFlags::empty(),
            type_info,
            value: Some(value),
        }
    }

    /// NULL parameter of the given type.
    pub fn null(name: impl Into<String>, type_info: TypeInfo) -> Self {
        Self {
            name: name.into(),
            flags: ParamFlags::empty(),
            type_info,
            value: None,
        }
    }

    /// `int` parameter.
    pub fn int(name: impl Into<String>, value: i32) -> Self {
        Self::new(name, TypeInfo::int(), Bytes::copy_from_slice(&value.to_le_bytes()))
    }

    /// `bigint` parameter.
    pub fn bigint(name: impl Into<String>, value: i64) -> Self {
        Self::new(name, TypeInfo::bigint(), Bytes::copy_from_slice(&value.to_le_bytes()))
    }

    /// `bit` parameter.
    pub fn bit(name: impl Into<String>, value: bool) -> Self {
        Self::new(name, TypeInfo::bit(), Bytes::copy_from_slice(&[u8::from(value)]))
    }

    /// `float` parameter.
    pub fn float(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, TypeInfo::float(), Bytes::copy_from_slice(&value.to_le_bytes()))
    }

    /// `nvarchar` parameter.
    pub fn nvarchar(name: impl Into<String>, value: &str) -> Self {
        let mut buf = BytesMut::with_capacity(utf16_byte_len(value));
        write_utf16_string(&mut buf, value);
        let type_info = TypeInfo::nvarchar(buf.len() / 2);
        Self::new(name, type_info, buf.freeze())
    }

    /// `varbinary` parameter.
    pub fn varbinary(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        let value = value.into();
        Self::new(name, TypeInfo::varbinary(value.len()), value)
    }

    /// Mark as an OUTPUT parameter.
    #[must_use]
    pub fn as_output(mut self) -> Self {
        self.flags |= ParamFlags::BY_REF;
        self
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        write_b_varchar(buf, &self.name)?;
        buf.put_u8(self.flags.bits());
        self.type_info.encode(buf);

        let Some(value) = &self.value else {
            match self.type_info.type_id {
                TypeId::NVarChar | TypeId::BigVarBinary if self.type_info.is_max() => {
                    buf.put_u64_le(PLP_NULL);
                }
                TypeId::NVarChar | TypeId::BigVarBinary => buf.put_u16_le(0xFFFF),
                _ => buf.put_u8(0),
            }
            return Ok(());
        };

        match self.type_info.type_id {
            TypeId::NVarChar | TypeId::BigVarBinary if self.type_info.is_max() => {
                // A single chunk followed by the terminator.
                let chunk = u32::try_from(value.len()).map_err(|_| ProtocolError::ValueTooLarge {
                    field: "PLP chunk",
                    len: value.len(),
                })?;
                buf.put_u64_le(value.len() as u64);
                buf.put_u32_le(chunk);
                buf.put_slice(value);
                buf.put_u32_le(0);
            }
            TypeId::NVarChar | TypeId::BigVarBinary => {
                let len = u16::try_from(value.len())
                    .ok()
                    .filter(|&len| len <= self.type_info.max_length)
                    .ok_or(ProtocolError::ValueTooLarge {
                        field: "parameter value",
                        len: value.len(),
                    })?;
                buf.put_u16_le(len);
                buf.put_slice(value);
            }
            _ => {
                let len = u8::try_from(value.len()).map_err(|_| ProtocolError::ValueTooLarge {
                    field: "parameter value",
                    len: value.len(),
                })?;
                buf.put_u8(len);
                buf.put_slice(value);
            }
        }
        Ok(())
    }
}

/// RPC request.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    proc_id: ProcId,
    options: RpcOptions,
    params: Vec<RpcParam>,
}

impl RpcRequest {
    /// Request for a well-known procedure.
    #[must_use]
    pub fn by_id(proc_id: ProcId) -> Self {
        Self {
            proc_id,
            options: RpcOptions::empty(),
            params: Vec::new(),
        }
    }

    /// `sp_executesql` call for a parameterized statement.
    ///
    /// Unnamed parameters are declared positionally as `@p1`, `@p2`, ...
    ///
    /// ```
    /// use tds_wire::{RpcParam, RpcRequest};
    ///
    /// let rpc = RpcRequest::execute_sql(
    ///     "SELECT * FROM users WHERE id = @p1 AND name = @p2",
    ///     vec![RpcParam::int("", 42), RpcParam::nvarchar("", "Alice")],
    /// );
    /// assert_eq!(rpc.params().len(), 4);
    /// ```
    pub fn execute_sql(sql: &str, params: Vec<RpcParam>) -> Self {
        let mut request = Self::by_id(ProcId::ExecuteSql);
        request.params.push(RpcParam::nvarchar("", sql));

        if !params.is_empty() {
            let params: Vec<RpcParam> = params
                .into_iter()
                .enumerate()
                .map(|(i, mut param)| {
                    if param.name.is_empty() {
                        param.name = format!("@p{}", i + 1);
                    } else if !param.name.starts_with('@') {
                        param.name.insert(0, '@');
                    }
                    param
                })
                .collect();
            let declarations = params
                .iter()
                .map(|p| format!("{} {}", p.name, p.type_info.sql_name()))
                .collect::<Vec<_>>()
                .join(", ");
            request.params.push(RpcParam::nvarchar("", &declarations));
            request.params.extend(params);
        }

        request
    }

    /// Set option flags.
    #[must_use]
    pub fn with_options(mut self, options: RpcOptions) -> Self {
        self.options = options;
        self
    }

    /// Append a parameter.
    #[must_use]
    pub fn param(mut self, param: RpcParam) -> Self {
        self.params.push(param);
        self
    }

    /// The procedure being called.
    #[must_use]
    pub fn proc_id(&self) -> ProcId {
        self.proc_id
    }

    /// Parameters in wire order.
    #[must_use]
    pub fn params(&self) -> &[RpcParam] {
        &self.params
    }

    /// Encode in auto-commit mode.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        self.encode_with_transaction(0)
    }

    /// Encode inside an explicit transaction.
    pub fn encode_with_transaction(&self, transaction_descriptor: u64) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(ALL_HEADERS_SIZE + 6 + self.params.len() * 16);
        write_all_headers(&mut buf, transaction_descriptor);

        buf.put_u16_le(0xFFFF);
        buf.put_u16_le(self.proc_id as u16);
        buf.put_u16_le(self.options.bits());

        for param in &self.params {
            param.encode(&mut buf)?;
        }

        Ok(buf.freeze())
    }
}
