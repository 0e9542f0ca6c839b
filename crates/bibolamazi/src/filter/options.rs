//! The option-string grammar filters are invoked with.
//!
//! Options are tokenized with shell quoting rules and may appear in any order:
//!
//! | Syntax                                  | Meaning                                          |
//! |-----------------------------------------|--------------------------------------------------|
//! | `--option-name value`, `--option-name=value` | keyword option, snake_case name hyphenated |
//! | `-sOptionName=value`                    | same, CamelCase name                             |
//! | `-dSwitchName`, `-dSwitchName=no`       | boolean switch, `true` when no value is given    |
//! | `token`                                 | extra positional argument (if accepted)          |
//!
//! Later occurrences of an option override earlier ones.

use super::*;

/// Parses an option string and checks that every required argument was supplied.
pub fn parse_option_string(spec: &OptionSpec, custom: &[ArgType], text: &str) -> Result<FilterArgs> {
  let args = parse_option_tokens(spec, custom, text)?;
  check_required(spec, &args)?;
  Ok(args)
}

/// Parses an option string without checking for required arguments.
#[instrument(skip(spec, custom), fields(filter = %spec.filter), level = "trace")]
pub fn parse_option_tokens(spec: &OptionSpec, custom: &[ArgType], text: &str) -> Result<FilterArgs> {
  let tokens = shlex::split(text)
    .ok_or_else(|| parse_error(spec, text, "unbalanced quotes or trailing escape character"))?;

  let mut args = FilterArgs::new();
  let mut tokens = tokens.into_iter().peekable();
  while let Some(token) = tokens.next() {
    if let Some(long) = token.strip_prefix("--") {
      let (name, value) = match long.split_once('=') {
        Some((name, value)) => (name, Some(value.to_string())),
        None => (long, None),
      };
      let key = name.replace('-', "_");
      let arg = lookup(spec, &key, &token)?;
      let value = match value {
        Some(value) => value,
        None if arg.is_some_and(OptionArg::is_bool) => {
          // `--flag no` takes the next token only when it reads as a boolean
          let next = tokens.peek().filter(|next| !next.starts_with('-')).and_then(|next| parse_bool(next));
          let flag = match next {
            Some(flag) => {
              tokens.next();
              flag
            },
            None => true,
          };
          args.keywords.insert(key, ArgValue::Bool(flag));
          continue;
        },
        None => tokens.next().ok_or_else(|| parse_error(spec, &token, "missing value"))?,
      };
      let value = convert(spec, custom, arg, &value, &token)?;
      args.keywords.insert(key, value);
    } else if let Some(rest) = token.strip_prefix("-s") {
      let (name, value) = rest
        .split_once('=')
        .ok_or_else(|| parse_error(spec, &token, "expected -sName=value"))?;
      let (key, arg) = lookup_switch(spec, name, &token)?;
      let value = convert(spec, custom, arg, value, &token)?;
      args.keywords.insert(key, value);
    } else if let Some(rest) = token.strip_prefix("-d") {
      let (name, value) = match rest.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (rest, None),
      };
      let (key, _) = lookup_switch(spec, name, &token)?;
      let flag = match value {
        None => true,
        Some(value) => parse_bool(value).ok_or_else(|| {
          parse_error(spec, &token, &format!("invalid boolean value `{value}` for switch -d{name}"))
        })?,
      };
      args.keywords.insert(key, ArgValue::Bool(flag));
    } else if token.starts_with('-') && !looks_numeric(&token) {
      return Err(parse_error(spec, &token, "unrecognized option syntax"));
    } else if spec.var_args {
      args.positional.push(ArgValue::Str(token));
    } else {
      return Err(parse_error(spec, &token, "this filter takes no positional arguments"));
    }
  }
  Ok(args)
}

/// Fails if a declared parameter without default was not supplied.
pub fn check_required(spec: &OptionSpec, args: &FilterArgs) -> Result<()> {
  match spec.args.iter().find(|a| a.is_required() && !args.keywords.contains_key(&a.name)) {
    Some(missing) => Err(parse_error(
      spec,
      &missing.long_name(),
      &format!("missing required argument `{}`", missing.name),
    )),
    None => Ok(()),
  }
}

/// The option named `key`, `None` for names only accepted through extra keyword arguments.
fn lookup<'a>(spec: &'a OptionSpec, key: &str, token: &str) -> Result<Option<&'a OptionArg>> {
  if key.is_empty() {
    return Err(parse_error(spec, token, "missing option name"));
  }
  match spec.get(key) {
    Some(arg) => Ok(Some(arg)),
    None if spec.var_kwargs => Ok(None),
    None => Err(parse_error(spec, token, &format!("unknown option `{key}`"))),
  }
}

/// Resolves a `-s`/`-d` switch name to the snake_case key and its option.
fn lookup_switch<'a>(
  spec: &'a OptionSpec,
  name: &str,
  token: &str,
) -> Result<(String, Option<&'a OptionArg>)> {
  if name.is_empty() {
    return Err(parse_error(spec, token, "missing switch name"));
  }
  if let Some(arg) = spec.by_switch_name(name) {
    return Ok((arg.name.clone(), Some(arg)));
  }
  if spec.var_kwargs {
    let key = if spec.camel_case { from_camel_case(name) } else { name.to_string() };
    return Ok((key, None));
  }
  Err(parse_error(spec, token, &format!("unknown switch `{name}`")))
}

/// Converts a value to the option's type.
fn convert(
  spec: &OptionSpec,
  custom: &[ArgType],
  arg: Option<&OptionArg>,
  value: &str,
  token: &str,
) -> Result<ArgValue> {
  let type_name = arg.and_then(|a| a.type_name.as_deref());
  coerce(value, type_name, custom).map_err(|message| parse_error(spec, token, &message))
}

/// `AddPrefix` → `add_prefix`.
fn from_camel_case(name: &str) -> String {
  let mut out = String::with_capacity(name.len() + 4);
  for (i, c) in name.chars().enumerate() {
    if c.is_uppercase() {
      if i > 0 {
        out.push('_');
      }
      out.extend(c.to_lowercase());
    } else {
      out.push(c);
    }
  }
  out
}

/// Whether a dash-prefixed token is a negative number rather than an option.
fn looks_numeric(token: &str) -> bool { token[1..].starts_with(|c: char| c.is_ascii_digit() || c == '.') }

/// An option parse error for `fragment`.
fn parse_error(spec: &OptionSpec, fragment: &str, message: &str) -> BibolamaziError {
  BibolamaziError::OptionParse {
    filter:   spec.filter.clone(),
    fragment: fragment.to_string(),
    message:  message.to_string(),
  }
}
