//! Constructor signatures, argument values and the option specification derived from them.
//!
//! A filter class declares its constructor as a [`Signature`]: ordered [`Param`]s with optional
//! defaults and type names, plus flags for extra positional and keyword arguments. Parameter
//! documentation lives in the class docstring as bullets:
//!
//! ```text
//! * fields (list): Fields to remove from every entry,
//!   separated by commas.
//! * verbose: Say more.
//! ```
//!
//! [`build_option_spec`] merges both into an [`OptionSpec`], rejecting documentation for
//! parameters the constructor does not have.

use super::*;

/// A parsed argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
  /// Boolean switch
  Bool(bool),
  /// Integer
  Int(i64),
  /// Floating point number
  Float(f64),
  /// Raw or string-typed value
  Str(String),
  /// Comma-separated list
  List(Vec<String>),
}

impl ArgValue {
  /// The value as a boolean, if it is one.
  pub fn as_bool(&self) -> Option<bool> {
    match self {
      ArgValue::Bool(b) => Some(*b),
      ArgValue::Str(s) => parse_bool(s),
      _ => None,
    }
  }

  /// The value as an integer, if it is one.
  pub fn as_int(&self) -> Option<i64> {
    match self {
      ArgValue::Int(i) => Some(*i),
      ArgValue::Str(s) => s.trim().parse().ok(),
      _ => None,
    }
  }

  /// The value as a float, if it is numeric.
  pub fn as_float(&self) -> Option<f64> {
    match self {
      ArgValue::Float(f) => Some(*f),
      ArgValue::Int(i) => Some(*i as f64),
      ArgValue::Str(s) => s.trim().parse().ok(),
      _ => None,
    }
  }

  /// The value as a string slice, if it is a string.
  pub fn as_str(&self) -> Option<&str> {
    match self {
      ArgValue::Str(s) => Some(s.as_str()),
      _ => None,
    }
  }

  /// The value as a list; a plain string is split on commas.
  pub fn as_list(&self) -> Option<Vec<String>> {
    match self {
      ArgValue::List(items) => Some(items.clone()),
      ArgValue::Str(s) => Some(split_list(s)),
      _ => None,
    }
  }
}

impl Display for ArgValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ArgValue::Bool(b) => write!(f, "{b}"),
      ArgValue::Int(i) => write!(f, "{i}"),
      ArgValue::Float(x) => write!(f, "{x}"),
      ArgValue::Str(s) => write!(f, "{s}"),
      ArgValue::List(items) => write!(f, "{}", items.join(",")),
    }
  }
}

impl From<bool> for ArgValue {
  fn from(value: bool) -> Self { ArgValue::Bool(value) }
}

impl From<i32> for ArgValue {
  fn from(value: i32) -> Self { ArgValue::Int(value.into()) }
}

impl From<i64> for ArgValue {
  fn from(value: i64) -> Self { ArgValue::Int(value) }
}

impl From<&str> for ArgValue {
  fn from(value: &str) -> Self { ArgValue::Str(value.to_string()) }
}

impl From<String> for ArgValue {
  fn from(value: String) -> Self { ArgValue::Str(value) }
}

/// Parses a boolean as accepted by `-dSwitch=value`.
pub fn parse_bool(value: &str) -> Option<bool> {
  match value.trim().to_ascii_lowercase().as_str() {
    "t" | "true" | "1" | "y" | "yes" | "on" => Some(true),
    "f" | "false" | "0" | "n" | "no" | "off" => Some(false),
    _ => None,
  }
}

/// Splits a comma-separated list, dropping empty items.
fn split_list(value: &str) -> Vec<String> {
  value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

/// Converter from option text to a value.
pub type ArgParser = Arc<dyn Fn(&str) -> std::result::Result<ArgValue, String> + Send + Sync>;

/// A named argument type.
#[derive(Clone)]
pub struct ArgType {
  /// Name used in signatures and docstrings
  pub name:  String,
  /// Converter
  pub parse: ArgParser,
}

impl ArgType {
  /// Defines a type.
  pub fn new<F>(name: impl Into<String>, parse: F) -> Self
  where F: Fn(&str) -> std::result::Result<ArgValue, String> + Send + Sync + 'static {
    Self { name: name.into(), parse: Arc::new(parse) }
  }

  /// One of the built-in types: `bool`, `int`, `float`, `str`, `list`.
  pub fn builtin(name: &str) -> Option<Self> {
    let parse: fn(&str) -> std::result::Result<ArgValue, String> = match name {
      "bool" => |s| parse_bool(s).map(ArgValue::Bool).ok_or_else(|| format!("invalid boolean `{s}`")),
      "int" => |s| s.trim().parse().map(ArgValue::Int).map_err(|_| format!("invalid integer `{s}`")),
      "float" => |s| s.trim().parse().map(ArgValue::Float).map_err(|_| format!("invalid number `{s}`")),
      "str" => |s| Ok(ArgValue::Str(s.to_string())),
      "list" => |s| Ok(ArgValue::List(split_list(s))),
      _ => return None,
    };
    Some(Self::new(name, parse))
  }
}

impl Debug for ArgType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ArgType").field("name", &self.name).finish()
  }
}

/// Converts option text to a value of the named type.
///
/// Custom types win over built-in ones; values of unknown or undeclared types stay strings.
pub fn coerce(
  value: &str,
  type_name: Option<&str>,
  custom: &[ArgType],
) -> std::result::Result<ArgValue, String> {
  let Some(type_name) = type_name else { return Ok(ArgValue::Str(value.to_string())) };
  if let Some(custom) = custom.iter().find(|t| t.name == type_name) {
    return (custom.parse)(value);
  }
  match ArgType::builtin(type_name) {
    Some(builtin) => (builtin.parse)(value),
    None => Ok(ArgValue::Str(value.to_string())),
  }
}

/// One constructor parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
  /// snake_case name
  pub name:      String,
  /// Default value; parameters without one are required
  pub default:   Option<ArgValue>,
  /// Declared type name
  pub type_name: Option<String>,
  /// Documentation, if given here rather than in the docstring
  pub doc:       Option<String>,
}

impl Param {
  /// A required parameter.
  pub fn required(name: impl Into<String>) -> Self {
    Self { name: name.into(), default: None, type_name: None, doc: None }
  }

  /// A parameter with a default value.
  pub fn optional(name: impl Into<String>, default: impl Into<ArgValue>) -> Self {
    Self { name: name.into(), default: Some(default.into()), type_name: None, doc: None }
  }

  /// Sets the declared type.
  pub fn typed(mut self, type_name: impl Into<String>) -> Self {
    self.type_name = Some(type_name.into());
    self
  }

  /// Sets the documentation.
  pub fn doc(mut self, doc: impl Into<String>) -> Self {
    self.doc = Some(doc.into());
    self
  }
}

/// A constructor signature.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
  /// Declared parameters, in order
  pub params:     Vec<Param>,
  /// Accepts extra positional arguments
  pub var_args:   bool,
  /// Accepts extra keyword arguments
  pub var_kwargs: bool,
}

impl Signature {
  /// A signature with the given parameters and no catch-alls.
  pub fn new(params: Vec<Param>) -> Self { Self { params, ..Self::default() } }

  /// Enables extra positional arguments.
  pub fn with_var_args(mut self) -> Self {
    self.var_args = true;
    self
  }

  /// Enables extra keyword arguments.
  pub fn with_var_kwargs(mut self) -> Self {
    self.var_kwargs = true;
    self
  }

  /// Parameter by name.
  pub fn param(&self, name: &str) -> Option<&Param> { self.params.iter().find(|p| p.name == name) }
}

/// A documented parameter found in a docstring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocArg {
  /// Parameter name
  pub name:      String,
  /// Type given in parentheses
  pub type_name: Option<String>,
  /// Text, continuation lines joined
  pub doc:       String,
}

lazy_static! {
  static ref DOC_BULLET: Regex =
    Regex::new(r"^\s*\*\s+(?P<name>\w+)\s*(?:\((?P<type>[^)]*)\))?\s*:\s*(?P<doc>.*)$")
      .expect("valid regex");
}

/// Extracts `* name (type): text` bullets from a docstring, in order.
///
/// Each bullet's text runs until the next bullet or the end of the docstring.
pub fn parse_docstring_args(docstring: &str) -> Vec<DocArg> {
  let mut args: Vec<DocArg> = Vec::new();
  for line in docstring.lines() {
    if let Some(captures) = DOC_BULLET.captures(line) {
      args.push(DocArg {
        name:      captures["name"].to_string(),
        type_name: captures
          .name("type")
          .map(|t| t.as_str().trim().to_string())
          .filter(|t| !t.is_empty()),
        doc:       captures["doc"].trim().to_string(),
      });
    } else if let Some(current) = args.last_mut() {
      let text = line.trim();
      if !text.is_empty() {
        if !current.doc.is_empty() {
          current.doc.push(' ');
        }
        current.doc.push_str(text);
      }
    }
  }
  args
}

/// One option a filter accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionArg {
  /// snake_case name
  pub name:      String,
  /// Type used to coerce values
  pub type_name: Option<String>,
  /// Documentation
  pub doc:       Option<String>,
  /// Default value; `None` with `declared` means required
  pub default:   Option<ArgValue>,
  /// Whether this is a constructor parameter rather than a documented extra keyword
  pub declared:  bool,
}

impl OptionArg {
  /// Whether a value must be supplied.
  pub fn is_required(&self) -> bool { self.declared && self.default.is_none() }

  /// Whether this option is a boolean switch.
  pub fn is_bool(&self) -> bool { self.type_name.as_deref() == Some("bool") }

  /// The `--long-form` of the option name.
  pub fn long_name(&self) -> String { format!("--{}", self.name.replace('_', "-")) }
}

/// Everything needed to parse an option string for one filter.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionSpec {
  /// Filter name, for error messages
  pub filter:     String,
  /// Options, constructor parameters first
  pub args:       Vec<OptionArg>,
  /// Accepts bare positional tokens
  pub var_args:   bool,
  /// Accepts undocumented keyword options
  pub var_kwargs: bool,
  /// Whether `-sName` uses auto-derived CamelCase names
  pub camel_case: bool,
}

impl OptionSpec {
  /// Option by snake_case name.
  pub fn get(&self, name: &str) -> Option<&OptionArg> { self.args.iter().find(|a| a.name == name) }

  /// The name an option is given in `-sName` / `-dName` form.
  pub fn switch_name(&self, arg: &OptionArg) -> String {
    if self.camel_case {
      to_camel_case(&arg.name)
    } else {
      arg.name.clone()
    }
  }

  /// Option for a `-sName` / `-dName` switch name.
  pub fn by_switch_name(&self, switch: &str) -> Option<&OptionArg> {
    self.args.iter().find(|a| self.switch_name(a) == switch)
  }

  /// Human-readable list of options, for `help` output.
  pub fn format_help(&self) -> String {
    let mut out = String::new();
    for arg in &self.args {
      let value = if arg.is_bool() { "[=BOOL]" } else { "=VALUE" };
      let prefix = if arg.is_bool() { "-d" } else { "-s" };
      out.push_str(&format!(
        "  {}{} | {}{}{}\n",
        arg.long_name(),
        value,
        prefix,
        self.switch_name(arg),
        value
      ));
      let mut details = arg.doc.clone().unwrap_or_default();
      if let Some(type_name) = &arg.type_name {
        details = format!("({type_name}) {details}");
      }
      match &arg.default {
        Some(default) => details.push_str(&format!(" [default: {default}]")),
        None if arg.declared => details.push_str(" [required]"),
        None => {},
      }
      out.push_str(&format!("      {}\n", details.trim()));
    }
    if self.var_args {
      out.push_str("  ARGS...\n      Additional positional arguments\n");
    }
    out
  }
}

/// `add_prefix` → `AddPrefix`.
pub fn to_camel_case(name: &str) -> String {
  name
    .split('_')
    .filter(|part| !part.is_empty())
    .map(|part| {
      let mut chars = part.chars();
      match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => String::new(),
      }
    })
    .collect()
}

/// Builds the option specification of a filter class from its signature and docstring.
///
/// Documented names that are not parameters are a specification error, unless the constructor
/// takes extra keyword arguments, in which case they become accepted options.
pub fn build_option_spec(class: &dyn FilterClass) -> Result<OptionSpec> {
  let signature = class.signature();
  let mut documented = parse_docstring_args(class.docstring());

  let mut args = Vec::with_capacity(signature.params.len());
  for param in &signature.params {
    let doc_arg = documented.iter().position(|d| d.name == param.name).map(|i| documented.remove(i));
    let type_name = param
      .type_name
      .clone()
      .or_else(|| doc_arg.as_ref().and_then(|d| d.type_name.clone()))
      .or_else(|| match param.default {
        Some(ArgValue::Bool(_)) => Some("bool".to_string()),
        Some(ArgValue::Int(_)) => Some("int".to_string()),
        _ => None,
      });
    args.push(OptionArg {
      name: param.name.clone(),
      type_name,
      doc: param.doc.clone().or_else(|| doc_arg.map(|d| d.doc)),
      default: param.default.clone(),
      declared: true,
    });
  }

  if !documented.is_empty() {
    if !signature.var_kwargs {
      let names: Vec<_> = documented.iter().map(|d| d.name.as_str()).collect();
      return Err(BibolamaziError::FilterSpecification {
        filter:  class.name().to_string(),
        message: format!("documented arguments are not constructor parameters: {}", names.join(", ")),
      });
    }
    args.extend(documented.into_iter().map(|d| OptionArg {
      name:      d.name,
      type_name: d.type_name,
      doc:       Some(d.doc),
      default:   None,
      declared:  false,
    }));
  }

  let camel_case = !signature.params.iter().any(|p| p.name.chars().any(char::is_uppercase));
  Ok(OptionSpec {
    filter: class.name().to_string(),
    args,
    var_args: signature.var_args,
    var_kwargs: signature.var_kwargs,
    camel_case,
  })
}

/// Arguments a filter is constructed with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterArgs {
  /// Extra positional arguments
  pub positional: Vec<ArgValue>,
  /// Keyword arguments by snake_case name
  pub keywords:   BTreeMap<String, ArgValue>,
}

impl FilterArgs {
  /// No arguments.
  pub fn new() -> Self { Self::default() }

  /// Builder-style keyword setter.
  pub fn with(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
    self.keywords.insert(name.into(), value.into());
    self
  }

  /// Keyword argument by name.
  pub fn get(&self, name: &str) -> Option<&ArgValue> { self.keywords.get(name) }

  /// Keyword argument as a boolean.
  pub fn get_bool(&self, name: &str) -> Option<bool> { self.get(name).and_then(ArgValue::as_bool) }

  /// Keyword argument as an integer.
  pub fn get_int(&self, name: &str) -> Option<i64> { self.get(name).and_then(ArgValue::as_int) }

  /// Keyword argument rendered as a string.
  pub fn get_str(&self, name: &str) -> Option<String> { self.get(name).map(ArgValue::to_string) }

  /// Keyword argument as a list.
  pub fn get_list(&self, name: &str) -> Option<Vec<String>> {
    self.get(name).and_then(ArgValue::as_list)
  }

  /// Overlays `other` on top of these arguments.
  pub fn merge(&mut self, other: FilterArgs) {
    self.positional.extend(other.positional);
    self.keywords.extend(other.keywords);
  }
}
