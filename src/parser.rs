//! Text form of a method, one instruction per line:
//!
//! ```text
//! method sum
//! block entry freq 1
//!   %base = param.i
//!   %x = load.f %base
//!   goto loop
//! block loop freq 10
//!   %acc = phi.f %x, %next
//!   %next = add.f %acc, %x
//!   %c = cmp.i %base, %base
//!   if %c, loop, done
//! block done freq 1
//!   ret %acc
//! ```
//!
//! Phi inputs may refer to values defined further down; everything else must be defined first.

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use crate::compiler::{
    cfg::{Method, MethodBuilder},
    error::CompileError,
    ops::{BlockId, NodeId, Opcode, RegClass},
};

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("line {line}: unknown operation `{op}`")]
    UnknownOperation { line: usize, op: String },
    #[error("line {line}: undefined value `%{name}`")]
    UndefinedValue { line: usize, name: String },
    #[error("line {line}: `%{name}` is defined twice")]
    DuplicateValue { line: usize, name: String },
    #[error("line {line}: unknown block `{name}`")]
    UnknownBlock { line: usize, name: String },
    #[error("line {line}: block `{name}` is declared twice")]
    DuplicateBlock { line: usize, name: String },
    #[error("line {line}: instruction outside of a block")]
    OutsideBlock { line: usize },
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("Invalid method: {0}")]
    Invalid(#[from] CompileError),
}

fn syntax(line: usize, message: impl Into<String>) -> ParseError {
    ParseError::Syntax { line, message: message.into() }
}

/// Splits `op.c` into the operation and its register class suffix.
fn class_suffix(line: usize, op: &str) -> Result<(&str, RegClass), ParseError> {
    let (name, suffix) = op.rsplit_once('.')
        .ok_or_else(|| syntax(line, format!("`{op}` needs a class suffix (.i or .f)")))?;
    let class = RegClass::from_suffix(suffix)
        .ok_or_else(|| syntax(line, format!("unknown register class `{suffix}`")))?;
    Ok((name, class))
}

struct Parser {
    b: MethodBuilder,
    values: HashMap<String, NodeId>,
    blocks: HashMap<String, BlockId>,
    /// phis whose inputs are resolved once every value is known
    phis: Vec<(usize, NodeId, Vec<String>)>,
}

impl Parser {
    fn value(&self, line: usize, arg: &str) -> Result<NodeId, ParseError> {
        let name = arg.strip_prefix('%').ok_or_else(|| syntax(line, format!("expected a value, found `{arg}`")))?;
        self.values.get(name).copied().ok_or_else(|| ParseError::UndefinedValue { line, name: name.to_string() })
    }

    fn block(&self, line: usize, name: &str) -> Result<BlockId, ParseError> {
        self.blocks.get(name).copied().ok_or_else(|| ParseError::UnknownBlock { line, name: name.to_string() })
    }

    fn values(&self, line: usize, args: &[&str]) -> Result<Vec<NodeId>, ParseError> {
        args.iter().map(|a| self.value(line, a)).collect()
    }

    fn instruction(&mut self, line: usize, dest: Option<&str>, op: &str, args: &[&str]) -> Result<(), ParseError> {
        let node = match op {
            "goto" => match args {
                [target] => {
                    let t = self.block(line, target)?;
                    self.b.goto(t)
                }
                _ => return Err(syntax(line, "goto takes one block")),
            },
            "if" => match args {
                [cond, t, f] => {
                    let cond = self.value(line, cond)?;
                    let (t, f) = (self.block(line, t)?, self.block(line, f)?);
                    self.b.branch(cond, t, f)
                }
                _ => return Err(syntax(line, "if takes a condition and two blocks")),
            },
            "ret" => match args {
                [] => self.b.ret(None),
                [v] => {
                    let v = self.value(line, v)?;
                    self.b.ret(Some(v))
                }
                _ => return Err(syntax(line, "ret takes at most one value")),
            },
            "con.i" => match args {
                [imm] => {
                    let v = imm.parse::<i64>().map_err(|e| syntax(line, format!("bad integer `{imm}`: {e}")))?;
                    self.b.con_i(v)
                }
                _ => return Err(syntax(line, "con.i takes one immediate")),
            },
            "con.f" => match args {
                [imm] => {
                    let v = imm.parse::<f64>().map_err(|e| syntax(line, format!("bad float `{imm}`: {e}")))?;
                    self.b.con_f(v)
                }
                _ => return Err(syntax(line, "con.f takes one immediate")),
            },
            _ => {
                if let Some(op) = Opcode::from_mnemonic(op) {
                    let inputs = self.values(line, args)?;
                    self.b.push(op, &inputs)
                } else {
                    match class_suffix(line, op)? {
                        ("param", class) if args.is_empty() => self.b.param(class),
                        ("copy", class) => match args {
                            [src] => {
                                let src = self.value(line, src)?;
                                self.b.copy(class, src)
                            }
                            _ => return Err(syntax(line, "copy takes one value")),
                        },
                        ("phi", class) => {
                            let phi = self.b.phi(class, &[]);
                            let names = args.iter().map(|a| a.to_string()).collect();
                            self.phis.push((line, phi, names));
                            phi
                        }
                        _ => return Err(ParseError::UnknownOperation { line, op: op.to_string() }),
                    }
                }
            }
        };

        let produces_value = self.b.node_class(node).is_some();
        match dest {
            Some(name) if produces_value => {
                if self.values.insert(name.to_string(), node).is_some() {
                    return Err(ParseError::DuplicateValue { line, name: name.to_string() });
                }
            }
            Some(name) => return Err(syntax(line, format!("`{op}` produces no value for `%{name}`"))),
            None if produces_value => return Err(syntax(line, format!("result of `{op}` needs a name"))),
            None => {}
        }
        Ok(())
    }
}

/// Parses `text` into a builder that has not been validated yet.
pub fn parse_builder(text: &str) -> Result<MethodBuilder, ParseError> {
    let lines: Vec<(usize, &str)> = text.lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.split('#').next().unwrap_or("").trim()))
        .filter(|(_, l)| !l.is_empty())
        .collect();

    let name = match lines.first() {
        Some((_, l)) if l.starts_with("method ") => l["method ".len()..].trim(),
        _ => "method",
    };
    let mut p = Parser {
        b: MethodBuilder::new(name),
        values: HashMap::default(),
        blocks: HashMap::default(),
        phis: Vec::new(),
    };

    // blocks first, so that branches can jump forward
    for &(line, l) in &lines {
        let words: Vec<&str> = l.split_whitespace().collect();
        if words[0] != "block" {
            continue;
        }
        let (name, freq) = match words[1..] {
            [name] => (name, 1.0),
            [name, "freq", f] => (name, f.parse::<f64>().map_err(|e| syntax(line, format!("bad frequency `{f}`: {e}")))?),
            _ => return Err(syntax(line, "expected `block <name> [freq <f>]`")),
        };
        if p.blocks.contains_key(name) {
            return Err(ParseError::DuplicateBlock { line, name: name.to_string() });
        }
        let id = if p.blocks.is_empty() {
            p.b.configure_block(BlockId::ENTRY, name, freq);
            BlockId::ENTRY
        } else {
            p.b.new_block(name, freq)
        };
        p.blocks.insert(name.to_string(), id);
    }

    let mut in_block = false;
    for &(line, l) in &lines {
        if l.starts_with("method ") {
            if line != lines[0].0 {
                return Err(syntax(line, "`method` must be the first line"));
            }
            continue;
        }
        if let Some(rest) = l.strip_prefix("block ") {
            let name = rest.split_whitespace().next().unwrap_or("");
            let id = p.block(line, name)?;
            p.b.switch_to_block(id);
            in_block = true;
            continue;
        }
        if !in_block {
            return Err(ParseError::OutsideBlock { line });
        }

        let (dest, body) = match l.split_once('=') {
            Some((d, body)) => {
                let d = d.trim();
                let name = d.strip_prefix('%').filter(|n| !n.is_empty())
                    .ok_or_else(|| syntax(line, format!("bad destination `{d}`")))?;
                (Some(name), body.trim())
            }
            None => (None, l),
        };
        let (op, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
        let args: Vec<&str> = rest.split(',').map(str::trim).filter(|a| !a.is_empty()).collect();
        p.instruction(line, dest, op, &args)?;
    }

    for (line, phi, names) in std::mem::take(&mut p.phis) {
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let inputs = p.values(line, &names)?;
        p.b.set_inputs(phi, &inputs);
    }
    Ok(p.b)
}

pub fn parse_method(text: &str) -> Result<Method, ParseError> {
    Ok(parse_builder(text)?.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOOP: &str = "
        method sum
        block entry freq 1
          %base = param.i
          %x = load.f %base
          goto loop
        block loop freq 10   # back edge from itself
          %acc = phi.f %x, %next
          %next = add.f %acc, %x
          %c = cmp.i %base, %base
          if %c, latch, done
        block latch freq 9
          goto loop
        block done freq 1
          store.f %base, %next
          ret %acc
    ";

    #[test]
    fn parses_a_loop() {
        let m = parse_method(LOOP).unwrap();
        assert_eq!(m.name, "sum");
        assert_eq!(m.cfg.len(), 4);
        let lp = m.cfg.block(BlockId(1));
        assert_eq!(lp.name, "loop");
        assert_eq!(lp.freq, 10.0);
        assert_eq!(lp.preds.len(), 2);
        assert_eq!(lp.loop_depth, 1);
        let phi = lp.phis(&m.graph).next().unwrap();
        assert_eq!(m.graph.node(phi).inputs.len(), 2);
        assert_eq!(m.graph.class_of(phi), Some(RegClass::Float));
    }

    #[test]
    fn errors_carry_line_numbers() {
        let err = parse_method("block entry\n  %a = param.i\n  %b = frob.i %a\n  ret").unwrap_err();
        assert_eq!(err, ParseError::UnknownOperation { line: 3, op: "frob.i".to_string() });

        let err = parse_method("block entry\n  %a = add.i %a, %b\n  ret").unwrap_err();
        assert_eq!(err, ParseError::UndefinedValue { line: 2, name: "a".to_string() });

        let err = parse_method("block entry\n  goto nowhere").unwrap_err();
        assert_eq!(err, ParseError::UnknownBlock { line: 2, name: "nowhere".to_string() });

        let err = parse_method("  %a = param.i\nblock entry\n  ret").unwrap_err();
        assert_eq!(err, ParseError::OutsideBlock { line: 1 });
    }

    #[test]
    fn names_must_be_unique() {
        let err = parse_method("block entry\n  %a = param.i\n  %a = param.i\n  ret").unwrap_err();
        assert_eq!(err, ParseError::DuplicateValue { line: 3, name: "a".to_string() });
        let err = parse_method("block entry\n  ret\nblock entry\n  ret").unwrap_err();
        assert_eq!(err, ParseError::DuplicateBlock { line: 3, name: "entry".to_string() });
    }

    #[test]
    fn graph_errors_surface_after_parsing() {
        let err = parse_method("block entry\n  %a = param.i\n  %x = add.f %a, %a\n  ret").unwrap_err();
        assert!(matches!(err, ParseError::Invalid(CompileError::MalformedGraph(_))), "{err}");
    }

    #[test]
    fn immediates() {
        let m = parse_method("block entry\n  %a = con.i -7\n  %b = con.f 2.5\n  %c = conv.i2f %a\n  %d = mul.f %b, %c\n  ret %d").unwrap();
        assert!(m.graph.nodes().any(|n| n.op == Opcode::ConI(-7)));
        assert!(m.graph.nodes().any(|n| n.op == Opcode::con_f(2.5)));
        assert!(matches!(parse_method("block entry\n  %a = con.i x\n  ret"), Err(ParseError::Syntax { line: 2, .. })));
    }
}
