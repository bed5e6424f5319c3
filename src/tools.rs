use crate::constants::DEFAULT_CSV_PREVIEW_ROWS;
use crate::message::ToolCall;
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ToolKind {
    Calculator,
    TextAnalysis,
}

impl ToolKind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            ToolKind::Calculator => "calculator",
            ToolKind::TextAnalysis => "text_analysis",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "calculator" => Some(ToolKind::Calculator),
            "text_analysis" => Some(ToolKind::TextAnalysis),
            _ => None,
        }
    }

    fn schema(self) -> Value {
        match self {
            ToolKind::Calculator => json!({
                "type": "function",
                "function": {
                    "name": "calculator",
                    "description": "Evaluate an arithmetic expression with + - * / % ** and ().",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "expression": { "type": "string", "description": "The expression to evaluate, e.g. (2 + 3) ** 2 / 5." }
                        },
                        "required": ["expression"],
                        "additionalProperties": false
                    }
                }
            }),
            ToolKind::TextAnalysis => json!({
                "type": "function",
                "function": {
                    "name": "text_analysis",
                    "description": "Get the text content of a file. Supported file types: .txt, .md, .csv, .json, .py. CSV files are summarized.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "filepath": { "type": "string", "description": "Path of the file to read." }
                        },
                        "required": ["filepath"],
                        "additionalProperties": false
                    }
                }
            }),
        }
    }
}

pub(crate) fn build_tools(tools: &[ToolKind]) -> Vec<Value> {
    tools.iter().map(|tool| tool.schema()).collect()
}

#[derive(Deserialize)]
pub(crate) struct CalculatorArgs {
    pub(crate) expression: String,
}

#[derive(Deserialize)]
pub(crate) struct TextAnalysisArgs {
    pub(crate) filepath: String,
}

/// Runs a tool call against the tools enabled for the current profile.
pub(crate) fn execute_tool(
    tool_call: &ToolCall,
    enabled: &[ToolKind],
    max_output_chars: usize,
) -> Result<String> {
    let Some(tool) = ToolKind::from_name(&tool_call.name).filter(|t| enabled.contains(t)) else {
        return Ok(tool_error(format!("Unknown tool: {}", tool_call.name)));
    };
    let args: Value = serde_json::from_str(&tool_call.arguments)
        .with_context(|| format!("invalid arguments for {}", tool_call.name))?;
    let output = match tool {
        ToolKind::Calculator => {
            let args: CalculatorArgs = serde_json::from_value(args)?;
            format_number(evaluate(&args.expression)?)
        }
        ToolKind::TextAnalysis => {
            let args: TextAnalysisArgs = serde_json::from_value(args)?;
            text_analysis(Path::new(&args.filepath))?
        }
    };
    let (output, truncated) = truncate(&output, max_output_chars);
    if truncated {
        Ok(format!("{output}\n[output truncated]"))
    } else {
        Ok(output)
    }
}

pub(crate) fn tool_error(message: String) -> String {
    json!({
        "error": message,
    })
    .to_string()
}

pub(crate) fn truncate(value: &str, limit: usize) -> (String, bool) {
    if value.chars().count() <= limit {
        return (value.to_string(), false);
    }
    (value.chars().take(limit).collect(), true)
}

/// Evaluates `+ - * / % **` over numbers and parentheses.
///
/// `**` is right-associative and binds tighter than unary minus on its left (`-2 ** 2 == -4`).
/// `%` takes the sign of the divisor.
pub(crate) fn evaluate(expression: &str) -> Result<f64> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        bail!("empty expression");
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if let Some(token) = parser.peek() {
        bail!("unexpected {token:?} at token {}", parser.pos + 1);
    }
    if !value.is_finite() {
        bail!("result is not a finite number");
    }
    Ok(value)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Pow,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Exponent suffix such as 1e-3.
                if i < chars.len() && matches!(chars[i], 'e' | 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && matches!(chars[j], '+' | '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| anyhow!("invalid number {literal:?}"))?;
                tokens.push(Token::Number(number));
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Pow);
                i += 2;
            }
            '+' | '-' | '*' | '/' | '%' | '(' | ')' => {
                tokens.push(match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '%' => Token::Percent,
                    '(' => Token::LParen,
                    _ => Token::RParen,
                });
                i += 1;
            }
            other => bail!("unsupported character {other:?}"),
        }
    }
    Ok(tokens)
}

// Every recursive path passes through `unary`, so this bounds the parser's stack use.
const MAX_NESTING: usize = 256;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.peek();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<f64> {
        let mut value = self.term()?;
        while let Some(op @ (Token::Plus | Token::Minus)) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == Token::Plus {
                value + rhs
            } else {
                value - rhs
            };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64> {
        let mut value = self.unary()?;
        while let Some(op @ (Token::Star | Token::Slash | Token::Percent)) = self.peek() {
            self.pos += 1;
            let rhs = self.unary()?;
            value = match op {
                Token::Star => value * rhs,
                _ if rhs == 0.0 => bail!("division by zero"),
                Token::Slash => value / rhs,
                _ => value - rhs * (value / rhs).floor(),
            };
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<f64> {
        if self.depth >= MAX_NESTING {
            bail!("expression nests deeper than {MAX_NESTING} levels");
        }
        self.depth += 1;
        let value = self.signed();
        self.depth -= 1;
        value
    }

    fn signed(&mut self) -> Result<f64> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<f64> {
        let base = self.atom()?;
        if self.peek() == Some(Token::Pow) {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<f64> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(value),
                    _ => bail!("missing closing parenthesis"),
                }
            }
            Some(token) => bail!("unexpected {token:?}"),
            None => bail!("unexpected end of expression"),
        }
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

pub(crate) fn text_analysis(path: &Path) -> Result<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let read = || {
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
    };
    match ext.as_str() {
        "txt" | "md" | "py" => read(),
        "json" => {
            let value: Value = serde_json::from_str(&read()?)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            Ok(serde_json::to_string_pretty(&value)?)
        }
        "csv" => summarize_csv(&read()?)
            .with_context(|| format!("invalid CSV in {}", path.display())),
        "" => bail!("Unsupported file type: (none)"),
        other => bail!("Unsupported file type: .{other}"),
    }
}

/// Row/column counts, header names and min/mean/max of the numeric columns.
fn summarize_csv(contents: &str) -> Result<String> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(contents.as_bytes());
    let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if columns.iter().all(String::is_empty) {
        return Ok("CSV file is empty.".to_string());
    }
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        rows.push(record);
    }

    let mut summary = format!(
        "CSV file loaded with {} rows and {} columns.\nColumns: {}",
        rows.len(),
        columns.len(),
        columns.join(", ")
    );

    let mut stats = Vec::new();
    for (idx, column) in columns.iter().enumerate() {
        let values: Option<Vec<f64>> = rows
            .iter()
            .filter_map(|row| row.get(idx).filter(|v| !v.is_empty()))
            .map(|v| v.parse::<f64>().ok())
            .collect();
        let Some(values) = values.filter(|v| !v.is_empty()) else {
            continue;
        };
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        stats.push(format!(
            "- {column}: count={} mean={} min={} max={}",
            values.len(),
            format_stat(mean),
            format_stat(min),
            format_stat(max)
        ));
    }
    if !stats.is_empty() {
        summary.push_str("\nSummary statistics:\n");
        summary.push_str(&stats.join("\n"));
    }

    let preview: Vec<String> = rows
        .iter()
        .take(DEFAULT_CSV_PREVIEW_ROWS)
        .map(|row| row.iter().collect::<Vec<_>>().join(", "))
        .collect();
    if !preview.is_empty() {
        summary.push_str("\nFirst rows:\n");
        summary.push_str(&preview.join("\n"));
    }
    Ok(summary)
}

fn format_stat(value: f64) -> String {
    if value.fract() == 0.0 {
        format_number(value)
    } else {
        format!("{value:.3}")
    }
}
