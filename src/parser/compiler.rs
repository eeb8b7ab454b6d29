use super::lexer::{parse_expr, split_assignment, split_words, strip_comment, DONT_TRACE_MARKER};
use super::types::{Function, Instr, Op, ParseError, Program, Stream, BUILTIN_EXCEPTIONS};
use crate::debugger::{FunctionLayout, LineScope, MODULE_FUNCTION};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
enum BlockKind {
    Try { at: usize },
    Catch { skip: usize },
    Loop { at: usize },
}

#[derive(Debug)]
struct OpenBlock {
    kind: BlockKind,
    id: u32,
    line: u32,
}

struct FunctionBuilder {
    name: String,
    def_line: u32,
    dont_trace: bool,
    body: Vec<Instr>,
    blocks: Vec<OpenBlock>,
    next_block_id: u32,
}

impl FunctionBuilder {
    fn new(name: &str, def_line: u32, dont_trace: bool) -> Self {
        Self {
            name: name.to_string(),
            def_line,
            dont_trace,
            body: Vec::new(),
            blocks: Vec::new(),
            next_block_id: 1,
        }
    }

    fn scope(&self) -> Vec<u32> {
        self.blocks.iter().map(|b| b.id).collect()
    }

    fn emit(&mut self, line: u32, op: Op, silent: bool, ignore_exceptions: bool) -> usize {
        self.body.push(Instr {
            line,
            scope: self.scope(),
            op,
            silent,
            ignore_exceptions,
        });
        self.body.len() - 1
    }

    fn open(&mut self, kind: BlockKind, line: u32) {
        let id = self.next_block_id;
        self.next_block_id += 1;
        self.blocks.push(OpenBlock { kind, id, line });
    }

    fn close(&mut self, line: u32) -> Result<(), ParseError> {
        let Some(block) = self.blocks.last() else {
            return Err(ParseError::new(line, "'end' without an open block"));
        };
        match block.kind {
            BlockKind::Try { .. } => Err(ParseError::new(line, "'try' block needs a 'catch' before 'end'")),
            BlockKind::Catch { skip } => {
                let end = self.emit(line, Op::EndHandler, true, false) + 1;
                if let Op::SkipHandler { end: target } = &mut self.body[skip].op {
                    *target = end;
                }
                self.blocks.pop();
                Ok(())
            }
            BlockKind::Loop { at } => {
                let end = self.emit(line, Op::LoopEnd { body: at + 1 }, true, false) + 1;
                if let Op::Loop { end: target, .. } = &mut self.body[at].op {
                    *target = end;
                }
                self.blocks.pop();
                Ok(())
            }
        }
    }

    fn catch(&mut self, line: u32, kinds: Vec<String>, binding: Option<String>) -> Result<(), ParseError> {
        let at = match self.blocks.last() {
            Some(OpenBlock {
                kind: BlockKind::Try { at },
                ..
            }) => *at,
            _ => return Err(ParseError::new(line, "'catch' without 'try'")),
        };
        let skip = self.emit(line, Op::SkipHandler { end: 0 }, true, false);
        self.blocks.pop();
        if let Op::Try {
            handler,
            kinds: try_kinds,
            binding: try_binding,
        } = &mut self.body[at].op
        {
            *handler = skip + 1;
            *try_kinds = kinds;
            *try_binding = binding;
        }
        self.open(BlockKind::Catch { skip }, line);
        Ok(())
    }

    fn finish(self) -> Result<Function, ParseError> {
        if let Some(block) = self.blocks.last() {
            return Err(ParseError::new(block.line, "block is never closed with 'end'"));
        }
        let layout = FunctionLayout {
            lines: self
                .body
                .iter()
                .filter(|i| !i.silent)
                .map(|i| LineScope {
                    line: i.line,
                    scope: i.scope.clone(),
                })
                .collect(),
        };
        Ok(Function {
            name: self.name,
            def_line: self.def_line,
            dont_trace: self.dont_trace,
            body: self.body,
            layout: Arc::new(layout),
        })
    }
}

fn no_args(words: &[String], line: u32) -> Result<(), ParseError> {
    if words.len() > 1 {
        return Err(ParseError::new(line, format!("'{}' takes no arguments", words[0])));
    }
    Ok(())
}

fn one_name(words: &[String], line: u32) -> Result<String, ParseError> {
    words
        .get(1)
        .cloned()
        .ok_or_else(|| ParseError::new(line, format!("'{}' needs a function name", words[0])))
}

/// Compile a trace script into per-function instruction lists.
pub fn parse_program(file: &str, source: &str) -> Result<Program, ParseError> {
    let mut module = FunctionBuilder::new(MODULE_FUNCTION, 1, false);
    let mut current: Option<FunctionBuilder> = None;
    let mut functions: HashMap<String, Arc<Function>> = HashMap::new();
    let mut exceptions: HashMap<String, String> = HashMap::new();
    let mut module_started = false;

    for (index, raw) in source.lines().enumerate() {
        let line = index as u32 + 1;
        let source_line = strip_comment(raw);
        let text = source_line.text;
        if text.is_empty() {
            continue;
        }

        let (keyword, rest) = match text.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (text, ""),
        };

        match keyword {
            "exception" => {
                if current.is_some() || !module.blocks.is_empty() {
                    return Err(ParseError::new(line, "exceptions are declared at top level"));
                }
                let words = split_words(rest, line)?;
                let (name, parent) = match words.as_slice() {
                    [name] => (name.clone(), "Exception".to_string()),
                    [name, colon, parent] if colon == ":" => (name.clone(), parent.clone()),
                    _ => return Err(ParseError::new(line, "expected 'exception NAME : PARENT'")),
                };
                let known = exceptions.contains_key(&parent)
                    || BUILTIN_EXCEPTIONS.iter().any(|(builtin, _)| *builtin == parent);
                if !known {
                    return Err(ParseError::new(line, format!("unknown exception kind '{}'", parent)));
                }
                exceptions.insert(name, parent);
                continue;
            }
            "fn" => {
                if current.is_some() || !module.blocks.is_empty() {
                    return Err(ParseError::new(line, "functions cannot be nested"));
                }
                let words = split_words(rest, line)?;
                let Some(name) = words.first() else {
                    return Err(ParseError::new(line, "'fn' needs a name"));
                };
                if functions.contains_key(name) {
                    return Err(ParseError::new(line, format!("function '{}' defined twice", name)));
                }
                let dont_trace = words[1..].iter().any(|w| w == DONT_TRACE_MARKER);
                current = Some(FunctionBuilder::new(name, line, dont_trace));
                continue;
            }
            _ => {}
        }

        let builder = current.as_mut().unwrap_or(&mut module);
        if builder.name == MODULE_FUNCTION && !module_started {
            builder.def_line = line;
            module_started = true;
        }
        let ignore = source_line.ignore_exceptions;
        let words = || split_words(text, line);

        match keyword {
            "end" => {
                if builder.blocks.is_empty() {
                    match current.take() {
                        Some(function) => {
                            let function = function.finish()?;
                            debug!(name = %function.name, instructions = function.body.len(), "Compiled function");
                            functions.insert(function.name.clone(), Arc::new(function));
                        }
                        None => return Err(ParseError::new(line, "'end' without an open block")),
                    }
                } else {
                    builder.close(line)?;
                }
            }
            "try" => {
                no_args(&words()?, line)?;
                let at = builder.emit(
                    line,
                    Op::Try {
                        handler: 0,
                        kinds: Vec::new(),
                        binding: None,
                    },
                    false,
                    ignore,
                );
                builder.open(BlockKind::Try { at }, line);
            }
            "catch" => {
                let mut kinds: Vec<String> = words()?.into_iter().skip(1).collect();
                let binding = match kinds.len() {
                    n if n >= 2 && kinds[n - 2] == "as" => {
                        let name = kinds.pop();
                        kinds.pop();
                        name
                    }
                    _ => None,
                };
                builder.catch(line, kinds, binding)?;
            }
            "loop" => {
                let count = parse_expr(rest).map_err(|e| ParseError::new(line, e))?;
                let at = builder.emit(line, Op::Loop { count, end: 0 }, false, ignore);
                builder.open(BlockKind::Loop { at }, line);
            }
            "set" => {
                let (name, expr) =
                    split_assignment(rest).ok_or_else(|| ParseError::new(line, "expected 'set NAME = EXPR'"))?;
                let expr = parse_expr(expr).map_err(|e| ParseError::new(line, e))?;
                builder.emit(line, Op::Set { name: name.to_string(), expr }, false, ignore);
            }
            "call" => {
                let function = one_name(&words()?, line)?;
                builder.emit(line, Op::Call { function }, false, ignore);
            }
            "print" | "eprint" => {
                let stream = if keyword == "print" { Stream::Stdout } else { Stream::Stderr };
                let words = words()?.into_iter().skip(1).collect();
                builder.emit(line, Op::Print { stream, words }, false, ignore);
            }
            "raise" => {
                let words = words()?;
                let kind = words
                    .get(1)
                    .cloned()
                    .ok_or_else(|| ParseError::new(line, "'raise' needs an exception kind"))?;
                let message = (words.len() > 2).then(|| words[2..].join(" "));
                builder.emit(line, Op::Raise { kind, message }, false, ignore);
            }
            "spawn" => {
                let words = words()?;
                let function = one_name(&words, line)?;
                builder.emit(
                    line,
                    Op::Spawn {
                        function,
                        name: words.get(2).cloned(),
                    },
                    false,
                    ignore,
                );
            }
            "fork" => {
                let function = one_name(&words()?, line)?;
                builder.emit(line, Op::Fork { function }, false, ignore);
            }
            "reraise" | "join" | "return" | "pass" => {
                no_args(&words()?, line)?;
                let op = match keyword {
                    "reraise" => Op::Reraise,
                    "join" => Op::Join,
                    "return" => Op::Return,
                    _ => Op::Pass,
                };
                builder.emit(line, op, false, ignore);
            }
            other => return Err(ParseError::new(line, format!("unknown statement '{}'", other))),
        }
    }

    if let Some(function) = current {
        return Err(ParseError::new(
            function.def_line,
            format!("function '{}' is never closed with 'end'", function.name),
        ));
    }

    Ok(Program {
        file: file.to_string(),
        module: Arc::new(module.finish()?),
        functions,
        exceptions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "\
exception ConfigError : ValueError
fn set_up
    set x = 1
    try
        raise ConfigError 'bad config'
    catch ConfigError as err
        print caught $err
    end
    loop 2
        set x = x + 1
    end
end
fn helper @DontTrace
    pass
end
call set_up
";

    #[test]
    fn test_parse_structure() {
        let program = parse_program("/work/app.trace", SCRIPT).unwrap();
        assert_eq!(program.exceptions.get("ConfigError").map(String::as_str), Some("ValueError"));
        assert!(program.functions["helper"].dont_trace);
        assert_eq!(program.module.def_line, 16);

        let set_up = &program.functions["set_up"];
        assert_eq!(set_up.def_line, 2);
        match &set_up.body[1].op {
            Op::Try { handler, kinds, binding } => {
                assert_eq!(kinds, &vec!["ConfigError".to_string()]);
                assert_eq!(binding.as_deref(), Some("err"));
                assert_eq!(set_up.body[*handler].line, 7);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &set_up.body[3].op {
            Op::SkipHandler { end } => assert_eq!(set_up.body[*end].line, 9),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scopes_and_layout() {
        let program = parse_program("/work/app.trace", SCRIPT).unwrap();
        let set_up = &program.functions["set_up"];
        let layout = &set_up.layout;
        assert_eq!(layout.scope_of(3), Some(&[][..]));
        assert_eq!(layout.scope_of(5), Some(&[1u32][..]));
        assert_eq!(layout.scope_of(7), Some(&[2u32][..]));
        assert_eq!(layout.scope_of(10), Some(&[3u32][..]));
        // Structural lines produce no line events.
        assert_eq!(layout.scope_of(6), None);
        assert_eq!(layout.scope_of(8), None);
        assert_eq!(set_up.index_of_line(9), Some(6));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_program("a", "fn f\npass\n").unwrap_err().line, 1);
        assert_eq!(parse_program("a", "try\npass\nend\n").unwrap_err().line, 3);
        assert_eq!(parse_program("a", "catch X\n").unwrap_err().line, 1);
        assert_eq!(parse_program("a", "loop 2\npass\n").unwrap_err().line, 1);
        assert_eq!(parse_program("a", "jump 3\n").unwrap_err().line, 1);
        assert!(parse_program("a", "exception Odd : Missing\n").is_err());
        assert!(parse_program("a", "print 'unterminated\n").is_err());
    }

    #[test]
    fn test_ignore_marker_is_recorded() {
        let program = parse_program("a", "raise ValueError x  # @IgnoreException\n").unwrap();
        assert!(program.module.body[0].ignore_exceptions);
    }
}
