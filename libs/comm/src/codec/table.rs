use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::value::Value;
use crate::wire::{keys, Header};

const DEFAULT_DELIMITER: &str = "\t";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Int,
    Float { precision: Option<usize> },
    Str,
}

#[derive(Debug, Clone, PartialEq)]
struct Column {
    kind: ColumnKind,
    spec: String,
}

/// Delimited-text codec for rows of typed columns
///
/// The layout is a printf-style `format_str` such as `"%d\t%.3f\t%s\n"`: one
/// conversion per column, a single delimiter between them and a newline at
/// the end. A value is one row (a list of column values) or a list of rows.
/// One line decodes to a row, several lines to a list of rows.
#[derive(Debug, Clone, Default)]
pub struct TableCodec {
    columns: Vec<Column>,
    delimiter: String,
    field_names: Vec<String>,
    field_units: Vec<String>,
}

impl TableCodec {
    pub const SERITYPE: &'static str = "table";

    pub fn new(format_str: &str, field_names: &[&str]) -> Result<Self> {
        let mut codec = Self::default();
        codec.set_format(format_str)?;
        codec.field_names = field_names.iter().map(|s| s.to_string()).collect();
        Ok(codec)
    }

    pub fn with_units(mut self, units: &[&str]) -> Self {
        self.field_units = units.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn format_str(&self) -> String {
        let specs: Vec<&str> = self.columns.iter().map(|c| c.spec.as_str()).collect();
        format!("{}\n", specs.join(self.delimiter.as_str()))
    }

    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    fn set_format(&mut self, format_str: &str) -> Result<()> {
        let body = format_str
            .strip_suffix('\n')
            .ok_or_else(|| Error::configuration("table format_str must end with a newline"))?;

        let mut columns = Vec::new();
        let mut separators = Vec::new();
        let mut rest = body;
        loop {
            let start = rest
                .find('%')
                .ok_or_else(|| Error::configuration(format!("bad table format '{format_str}'")))?;
            if !columns.is_empty() {
                separators.push(rest[..start].to_string());
            } else if start != 0 {
                return Err(Error::configuration(format!(
                    "table format '{format_str}' has text before its first column"
                )));
            }
            let after = &rest[start + 1..];
            let conv = after
                .find(|c: char| c.is_ascii_alphabetic())
                .ok_or_else(|| Error::configuration(format!("bad table format '{format_str}'")))?;
            let modifiers = &after[..conv];
            let kind = match &after[conv..conv + 1] {
                "d" | "i" | "u" => ColumnKind::Int,
                "f" | "g" | "e" => ColumnKind::Float {
                    precision: modifiers
                        .split_once('.')
                        .and_then(|(_, p)| p.parse().ok()),
                },
                "s" => ColumnKind::Str,
                other => {
                    return Err(Error::configuration(format!(
                        "unsupported table conversion '%{other}'"
                    )))
                }
            };
            columns.push(Column {
                kind,
                spec: rest[start..start + 2 + conv].to_string(),
            });
            rest = &after[conv + 1..];
            if !rest.contains('%') {
                if !rest.is_empty() {
                    return Err(Error::configuration(format!(
                        "table format '{format_str}' has trailing text"
                    )));
                }
                break;
            }
        }

        let delimiter = separators
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_DELIMITER.to_string());
        if delimiter.is_empty() || separators.iter().any(|s| *s != delimiter) {
            return Err(Error::configuration(format!(
                "table format '{format_str}' must use one non-empty delimiter"
            )));
        }

        self.columns = columns;
        self.delimiter = delimiter;
        Ok(())
    }

    fn rows<'a>(&self, value: &'a Value) -> Result<Vec<&'a [Value]>> {
        let items = value.as_list().ok_or_else(|| {
            Error::Serialization(format!("table codec cannot encode a {} value", value.kind()))
        })?;
        if !items.is_empty() && items.iter().all(|v| matches!(v, Value::List(_))) {
            Ok(items.iter().filter_map(Value::as_list).collect())
        } else {
            Ok(vec![items])
        }
    }

    fn write_row(&self, row: &[Value], out: &mut String) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::Serialization(format!(
                "row has {} fields, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        for (i, (column, field)) in self.columns.iter().zip(row).enumerate() {
            if i > 0 {
                out.push_str(&self.delimiter);
            }
            let text = match (column.kind, field) {
                (ColumnKind::Int, Value::Int(n)) => n.to_string(),
                (ColumnKind::Float { precision: Some(p) }, Value::Float(f)) => format!("{f:.p$}"),
                (ColumnKind::Float { precision: Some(p) }, Value::Int(n)) => {
                    format!("{:.p$}", *n as f64)
                }
                (ColumnKind::Float { precision: None }, Value::Float(f)) => format!("{f:?}"),
                (ColumnKind::Float { precision: None }, Value::Int(n)) => format!("{:?}", *n as f64),
                (ColumnKind::Str, Value::Str(s)) => s.clone(),
                (ColumnKind::Str, Value::Bytes(b)) => String::from_utf8(b.clone())
                    .map_err(|e| Error::Serialization(e.to_string()))?,
                (kind, other) => {
                    return Err(Error::Serialization(format!(
                        "column {i} expects {kind:?}, got a {} value",
                        other.kind()
                    )))
                }
            };
            if text.contains(&self.delimiter) || text.contains('\n') {
                return Err(Error::Serialization(format!(
                    "column {i} value contains the delimiter or a newline"
                )));
            }
            out.push_str(&text);
        }
        out.push('\n');
        Ok(())
    }

    fn read_row(&self, line: &str) -> Result<Value> {
        let fields: Vec<&str> = line.split(self.delimiter.as_str()).collect();
        if fields.len() != self.columns.len() {
            return Err(Error::Serialization(format!(
                "line has {} fields, table has {} columns",
                fields.len(),
                self.columns.len()
            )));
        }
        let row = self
            .columns
            .iter()
            .zip(fields)
            .map(|(column, field)| match column.kind {
                ColumnKind::Int => field
                    .trim()
                    .parse()
                    .map(Value::Int)
                    .map_err(|e| Error::Serialization(format!("bad int '{field}': {e}"))),
                ColumnKind::Float { .. } => field
                    .trim()
                    .parse()
                    .map(Value::Float)
                    .map_err(|e| Error::Serialization(format!("bad float '{field}': {e}"))),
                ColumnKind::Str => Ok(Value::Str(field.to_string())),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::List(row))
    }
}

fn split_list(value: Option<&str>) -> Vec<String> {
    match value {
        Some(v) if !v.is_empty() => v.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

impl Codec for TableCodec {
    fn seritype(&self) -> &'static str {
        Self::SERITYPE
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        if !self.is_initialized() {
            return Err(Error::serialization("table codec has no format"));
        }
        let mut out = String::new();
        for row in self.rows(value)? {
            self.write_row(row, &mut out)?;
        }
        Ok(out.into_bytes())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        if !self.is_initialized() {
            return Err(Error::serialization("table codec has no format"));
        }
        let text = std::str::from_utf8(bytes).map_err(|e| Error::Serialization(e.to_string()))?;
        let mut rows = text
            .lines()
            .map(|line| self.read_row(line))
            .collect::<Result<Vec<_>>>()?;
        if rows.len() == 1 {
            Ok(rows.remove(0))
        } else {
            Ok(Value::List(rows))
        }
    }

    fn type_descriptor(&self) -> Header {
        let mut header = Header::new().with(keys::SERITYPE, Self::SERITYPE);
        if self.is_initialized() {
            header.insert(keys::FORMAT_STR, self.format_str());
        }
        if !self.field_names.is_empty() {
            header.insert(keys::FIELD_NAMES, self.field_names.join(","));
        }
        if !self.field_units.is_empty() {
            header.insert(keys::FIELD_UNITS, self.field_units.join(","));
        }
        header
    }

    fn update_from_descriptor(&mut self, descriptor: &Header) -> Result<()> {
        if let Some(format_str) = descriptor.get(keys::FORMAT_STR) {
            self.set_format(format_str)?;
        }
        let names = split_list(descriptor.get(keys::FIELD_NAMES));
        if !names.is_empty() {
            self.field_names = names;
        }
        let units = split_list(descriptor.get(keys::FIELD_UNITS));
        if !units.is_empty() {
            self.field_units = units;
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        !self.columns.is_empty()
    }

    fn infer_from(&mut self, value: &Value) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let rows = self.rows(value)?;
        let first = rows
            .first()
            .ok_or_else(|| Error::serialization("cannot infer a table format from no rows"))?;
        let specs = first
            .iter()
            .map(|field| match field {
                Value::Int(_) => Ok("%d"),
                Value::Float(_) => Ok("%f"),
                Value::Str(_) | Value::Bytes(_) => Ok("%s"),
                other => Err(Error::Serialization(format!(
                    "cannot store a {} value in a table",
                    other.kind()
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        self.set_format(&format!("{}\n", specs.join(DEFAULT_DELIMITER)))?;
        if self.field_names.is_empty() {
            self.field_names = (0..specs.len()).map(|i| format!("f{i}")).collect();
        }
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }
}
