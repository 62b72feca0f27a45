//! Orchestra parsing and compilation.
//!
//! An orchestra is a header (`ksmps`, `nchnls`, `0dbfs`), a set of exported
//! channels, and instrument definitions. Compilation resolves every name to
//! an index - channel, voice-local slot, p-field - so nothing is looked up
//! by string once the audio thread runs.

use std::collections::HashMap;

use cadenza_core::{EngineError, Result};

use crate::expr::{Expr, ExprParser, Resolve, Token, tokenize};

/// Data flow direction of an exported channel, from the instrument's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDirection {
    /// `chnexport "...", 1` - filled by the host, read by instruments
    Input,
    /// `chnexport "...", 2` - written by instruments, read by the host
    Output,
}

/// Update rate of an exported channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRate {
    /// `ga` prefix: one value per frame
    Audio,
    /// `gk` prefix: one value per ksmps tick
    Control,
}

/// One `chnexport` declaration.
#[derive(Debug, Clone)]
pub struct ChannelDecl {
    /// Orchestra variable, e.g. `gaOutLeft`
    pub var: String,
    /// Exported name, e.g. `out:left`
    pub name: String,
    pub direction: ChannelDirection,
    pub rate: ChannelRate,
}

/// Assignment target inside an instrument body.
#[derive(Debug, Clone, Copy)]
pub enum Target {
    Local(usize),
    Channel(usize),
}

/// One compiled statement.
#[derive(Debug, Clone)]
pub enum Stmt {
    Assign {
        target: Target,
        expr: Expr,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
}

/// One compiled instrument.
#[derive(Debug, Clone)]
pub struct Instrument {
    pub number: i32,
    pub statements: Vec<Stmt>,
    pub num_locals: usize,
    /// Oscillator/sample state slots a voice must carry
    pub num_states: usize,
}

/// A compiled orchestra.
#[derive(Debug, Clone)]
pub struct Orchestra {
    pub ksmps: usize,
    pub nchnls: usize,
    pub zero_dbfs: f32,
    pub channels: Vec<ChannelDecl>,
    pub instruments: Vec<Instrument>,
}

impl Orchestra {
    pub fn parse(text: &str) -> Result<Self> {
        Parser::new().parse(text)
    }

    pub fn instrument_index(&self, number: i32) -> Option<usize> {
        self.instruments.iter().position(|i| i.number == number)
    }
}

/// Resolver for one instrument body.
struct InstrumentScope<'a> {
    channels: &'a [ChannelDecl],
    locals: HashMap<String, usize>,
}

impl InstrumentScope<'_> {
    fn local_slot(&mut self, name: &str) -> usize {
        let next = self.locals.len();
        *self.locals.entry(name.to_owned()).or_insert(next)
    }

    fn target(&mut self, name: &str) -> Result<Target> {
        if let Some(idx) = self.channels.iter().position(|c| c.var == name) {
            return Ok(Target::Channel(idx));
        }
        if name.starts_with('p') && name[1..].chars().all(|c| c.is_ascii_digit()) {
            return Err(EngineError::Error(format!("cannot assign to p-field {name}")));
        }
        Ok(Target::Local(self.local_slot(name)))
    }
}

impl Resolve for InstrumentScope<'_> {
    fn resolve(&mut self, name: &str) -> Result<Expr> {
        if let Some(rest) = name.strip_prefix('p')
            && !rest.is_empty()
            && rest.chars().all(|c| c.is_ascii_digit())
        {
            let idx: usize = rest.parse().unwrap();
            if idx == 0 || idx > 16 {
                return Err(EngineError::Error(format!("p-field {name} out of range")));
            }
            return Ok(Expr::PField(idx));
        }
        if let Some(idx) = self.channels.iter().position(|c| c.var == name) {
            return Ok(Expr::Channel(idx));
        }
        // Locals spring into existence on first mention, initialized to 0
        Ok(Expr::Local(self.local_slot(name)))
    }
}

struct Parser {
    ksmps: usize,
    nchnls: usize,
    zero_dbfs: f32,
    channels: Vec<ChannelDecl>,
    instruments: Vec<Instrument>,
}

impl Parser {
    fn new() -> Self {
        Self {
            ksmps: 32,
            nchnls: 2,
            zero_dbfs: 1.0,
            channels: Vec::new(),
            instruments: Vec::new(),
        }
    }

    fn parse(mut self, text: &str) -> Result<Orchestra> {
        let mut lines = text.lines().map(str::trim).enumerate();

        while let Some((line_no, line)) = lines.next() {
            let tokens = tokenize(line)
                .map_err(|err| EngineError::Error(format!("line {}: {err}", line_no + 1)))?;
            if tokens.is_empty() {
                continue;
            }

            match &tokens[..] {
                // `0dbfs = 1.0` tokenizes as Number(0) Ident("dbfs") ...
                [Token::Number(z), Token::Ident(kw), Token::Punct('='), Token::Number(v)]
                    if *z == 0.0 && kw == "dbfs" =>
                {
                    self.zero_dbfs = *v;
                }
                [Token::Ident(kw), Token::Punct('='), Token::Number(v)] if kw == "ksmps" => {
                    if *v < 1.0 {
                        return Err(EngineError::Error("ksmps must be at least 1".into()));
                    }
                    self.ksmps = *v as usize;
                }
                [Token::Ident(kw), Token::Punct('='), Token::Number(v)] if kw == "nchnls" => {
                    self.nchnls = *v as usize;
                }
                [
                    Token::Ident(var),
                    Token::Ident(kw),
                    Token::Str(name),
                    Token::Punct(','),
                    Token::Number(mode),
                ] if kw == "chnexport" => {
                    self.channels.push(channel_decl(var, name, *mode)?);
                }
                [Token::Ident(kw), Token::Number(number)] if kw == "instr" => {
                    let number = *number as i32;
                    let body = collect_body(&mut lines)?;
                    let instrument = self.compile_instrument(number, &body)?;
                    self.instruments.push(instrument);
                }
                _ => {
                    return Err(EngineError::Error(format!(
                        "line {}: cannot parse '{line}'",
                        line_no + 1
                    )));
                }
            }
        }

        Ok(Orchestra {
            ksmps: self.ksmps,
            nchnls: self.nchnls,
            zero_dbfs: self.zero_dbfs,
            channels: self.channels,
            instruments: self.instruments,
        })
    }

    fn compile_instrument(&self, number: i32, body: &[Vec<Token>]) -> Result<Instrument> {
        let mut scope = InstrumentScope {
            channels: &self.channels,
            locals: HashMap::new(),
        };
        let mut num_states = 0;
        let mut at = 0;
        let statements = compile_block(body, &mut at, &mut scope, &mut num_states, None)?;
        if at != body.len() {
            return Err(EngineError::Error(format!(
                "instr {number}: unexpected '{:?}'",
                body[at]
            )));
        }
        Ok(Instrument {
            number,
            statements,
            num_locals: scope.locals.len(),
            num_states,
        })
    }
}

fn channel_decl(var: &str, name: &str, mode: f32) -> Result<ChannelDecl> {
    let rate = if var.starts_with("ga") {
        ChannelRate::Audio
    } else if var.starts_with("gk") {
        ChannelRate::Control
    } else {
        return Err(EngineError::Error(format!(
            "channel variable '{var}' must start with 'ga' or 'gk'"
        )));
    };
    let direction = match mode as i32 {
        1 => ChannelDirection::Input,
        2 => ChannelDirection::Output,
        other => {
            return Err(EngineError::Error(format!(
                "channel '{name}': bad chnexport mode {other}"
            )));
        }
    };
    Ok(ChannelDecl {
        var: var.to_owned(),
        name: name.to_owned(),
        direction,
        rate,
    })
}

/// Pull tokenized lines until `endin`.
fn collect_body<'a>(
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
) -> Result<Vec<Vec<Token>>> {
    let mut body = Vec::new();
    for (line_no, line) in lines.by_ref() {
        let tokens =
            tokenize(line).map_err(|err| EngineError::Error(format!("line {}: {err}", line_no + 1)))?;
        if tokens.is_empty() {
            continue;
        }
        if matches!(&tokens[..], [Token::Ident(kw)] if kw == "endin") {
            return Ok(body);
        }
        body.push(tokens);
    }
    Err(EngineError::Error("missing 'endin'".into()))
}

/// Compile statements until end-of-body or one of `stop_at` keywords.
fn compile_block(
    body: &[Vec<Token>],
    at: &mut usize,
    scope: &mut InstrumentScope<'_>,
    num_states: &mut usize,
    stop_at: Option<&[&str]>,
) -> Result<Vec<Stmt>> {
    let mut statements = Vec::new();

    while *at < body.len() {
        let tokens = &body[*at];

        if let [Token::Ident(kw), ..] = &tokens[..]
            && let Some(stops) = stop_at
            && stops.contains(&kw.as_str())
        {
            return Ok(statements);
        }

        *at += 1;
        match &tokens[..] {
            [Token::Ident(kw), rest @ ..] if kw == "if" => {
                let Some(Token::Ident(then_kw)) = rest.last() else {
                    return Err(EngineError::Error("'if' without 'then'".into()));
                };
                if then_kw != "then" {
                    return Err(EngineError::Error("'if' without 'then'".into()));
                }
                let cond_tokens = &rest[..rest.len() - 1];
                let mut parser = ExprParser::new(cond_tokens);
                let cond = parser.parse(scope)?;
                if !parser.at_end() {
                    return Err(EngineError::Error("trailing tokens after 'if'".into()));
                }

                let then_body =
                    compile_block(body, at, scope, num_states, Some(&["else", "endif"]))?;
                let mut else_body = Vec::new();
                if matches!(body.get(*at).map(Vec::as_slice), Some([Token::Ident(kw)]) if kw == "else")
                {
                    *at += 1;
                    else_body = compile_block(body, at, scope, num_states, Some(&["endif"]))?;
                }
                if !matches!(body.get(*at).map(Vec::as_slice), Some([Token::Ident(kw)]) if kw == "endif")
                {
                    return Err(EngineError::Error("'if' without 'endif'".into()));
                }
                *at += 1;

                statements.push(Stmt::If {
                    cond,
                    then_body,
                    else_body,
                });
            }
            [Token::Ident(var), Token::Punct('='), rest @ ..] => {
                let mut parser = ExprParser::new(rest);
                let expr = parser.parse(scope)?;
                if !parser.at_end() {
                    return Err(EngineError::Error(format!(
                        "trailing tokens after assignment to '{var}'"
                    )));
                }
                statements.push(Stmt::Assign {
                    target: scope.target(var)?,
                    expr,
                });
            }
            [Token::Ident(var), Token::Ident(opcode), rest @ ..] if opcode == "oscil" => {
                let (amp, freq) = parse_two_args(rest, scope, "oscil")?;
                let state = *num_states;
                *num_states += 1;
                statements.push(Stmt::Assign {
                    target: scope.target(var)?,
                    expr: Expr::Oscil {
                        amp: Box::new(amp),
                        freq: Box::new(freq),
                        state,
                    },
                });
            }
            [
                Token::Ident(var),
                Token::Ident(opcode),
                Token::Number(table),
                Token::Punct(','),
                rest @ ..,
            ] if opcode == "sample" => {
                let (amp, pitch) = parse_two_args(rest, scope, "sample")?;
                let state = *num_states;
                *num_states += 1;
                statements.push(Stmt::Assign {
                    target: scope.target(var)?,
                    expr: Expr::Sample {
                        table: *table as u32,
                        amp: Box::new(amp),
                        pitch: Box::new(pitch),
                        state,
                    },
                });
            }
            other => {
                return Err(EngineError::Error(format!(
                    "cannot parse statement {other:?}"
                )));
            }
        }
    }

    if stop_at.is_some() {
        return Err(EngineError::Error("unterminated block".into()));
    }
    Ok(statements)
}

fn parse_two_args(
    tokens: &[Token],
    scope: &mut InstrumentScope<'_>,
    opcode: &str,
) -> Result<(Expr, Expr)> {
    let mut parser = ExprParser::new(tokens);
    let first = parser.parse(scope)?;
    if !parser.eat_comma() {
        return Err(EngineError::Error(format!("{opcode} needs two arguments")));
    }
    let second = parser.parse(scope)?;
    if !parser.at_end() {
        return Err(EngineError::Error(format!(
            "trailing tokens after {opcode}"
        )));
    }
    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
0dbfs = 1.0
ksmps = 32
nchnls = 2

gaIn chnexport "in", 1
gaOut chnexport "out", 2
gkGain chnexport "gain", 1

instr 1
  aSig oscil p5 / 127, cpsmidinn(p4)
  gaOut = gaOut + aSig * gkGain
endin
"#;

    #[test]
    fn test_parse_basic_orchestra() {
        let orchestra = Orchestra::parse(BASIC).unwrap();
        assert_eq!(orchestra.ksmps, 32);
        assert_eq!(orchestra.nchnls, 2);
        assert_eq!(orchestra.channels.len(), 3);
        assert_eq!(orchestra.channels[0].name, "in");
        assert_eq!(orchestra.channels[0].direction, ChannelDirection::Input);
        assert_eq!(orchestra.channels[0].rate, ChannelRate::Audio);
        assert_eq!(orchestra.channels[2].rate, ChannelRate::Control);
        assert_eq!(orchestra.instruments.len(), 1);
        let instr = &orchestra.instruments[0];
        assert_eq!(instr.number, 1);
        assert_eq!(instr.num_states, 1);
        assert_eq!(instr.num_locals, 1);
    }

    #[test]
    fn test_if_else() {
        let text = r#"
gkMuted chnexport "muted", 1
gaOut chnexport "out", 2

instr 2
  if gkMuted > 0.5 then
    gaOut = 0
  else
    gaOut = gaOut * 2
  endif
endin
"#;
        let orchestra = Orchestra::parse(text).unwrap();
        let instr = &orchestra.instruments[0];
        assert_eq!(instr.statements.len(), 1);
        assert!(matches!(instr.statements[0], Stmt::If { .. }));
    }

    #[test]
    fn test_missing_endin_is_rejected() {
        assert!(Orchestra::parse("instr 1\n aOut = 0\n").is_err());
    }

    #[test]
    fn test_bad_channel_prefix_is_rejected() {
        assert!(Orchestra::parse("foo chnexport \"x\", 1\n").is_err());
    }

    #[test]
    fn test_assign_to_pfield_is_rejected() {
        assert!(Orchestra::parse("instr 1\n p4 = 1\nendin\n").is_err());
    }

    #[test]
    fn test_instrument_index() {
        let orchestra = Orchestra::parse("instr 7\n a = 0\nendin\n").unwrap();
        assert_eq!(orchestra.instrument_index(7), Some(0));
        assert_eq!(orchestra.instrument_index(1), None);
    }
}
