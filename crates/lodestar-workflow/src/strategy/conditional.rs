//! Conditional execution strategy and its boolean expression evaluator.
//!
//! Expressions compare context variables with `==` / `!=` and combine
//! comparisons with `&&`, `||`, `!` and parentheses. Literals are quoted
//! with `'` or `"`; bare identifiers resolve to context values, and a
//! standalone operand is truthy when it equals `true`.

use crate::context::ExecutionContext;
use crate::definition::{StrategyType, TaskDefinitionId};
use crate::error::{WorkflowError, WorkflowResult};
use crate::state::{WorkflowExecutionId, WorkflowStatus};
use crate::strategy::sequential::drive_ordered;
use crate::strategy::{drive_subset, ExecutionStrategy, StrategyCore};
use async_trait::async_trait;

/// Drives tasks in order, gated by their conditional expressions.
pub struct ConditionalStrategy {
    core: StrategyCore,
}

impl ConditionalStrategy {
    /// Creates a conditional strategy.
    pub fn new(core: StrategyCore) -> Self {
        Self { core }
    }
}

#[async_trait]
impl ExecutionStrategy for ConditionalStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Conditional
    }

    async fn execute(&self, workflow_id: WorkflowExecutionId) -> WorkflowResult<WorkflowStatus> {
        drive_ordered(&self.core, workflow_id, true).await
    }

    async fn execute_subset(
        &self,
        workflow_id: WorkflowExecutionId,
        task_ids: &[TaskDefinitionId],
    ) -> WorkflowResult<WorkflowStatus> {
        drive_subset(&self.core, workflow_id, task_ids).await
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Eq,
    Ne,
    /// Operand text; `true` when it was quoted (a literal).
    Operand(String, bool),
}

fn tokenize(expression: &str) -> WorkflowResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expression.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(WorkflowError::Validation(
                        "expected '&&' in conditional expression".to_string(),
                    ));
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(WorkflowError::Validation(
                        "expected '||' in conditional expression".to_string(),
                    ));
                }
                tokens.push(Token::Or);
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(WorkflowError::Validation(
                        "expected '==' in conditional expression".to_string(),
                    ));
                }
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => literal.push(ch),
                        None => {
                            return Err(WorkflowError::Validation(
                                "unterminated string literal in conditional expression".to_string(),
                            ));
                        }
                    }
                }
                tokens.push(Token::Operand(literal, true));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' || ch == '.' || ch == '-' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Operand(ident, false));
            }
            other => {
                return Err(WorkflowError::Validation(format!(
                    "unexpected character '{}' in conditional expression",
                    other
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    context: &'a ExecutionContext,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> WorkflowResult<bool> {
        let mut value = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn parse_and(&mut self) -> WorkflowResult<bool> {
        let mut value = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_unary()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn parse_unary(&mut self) -> WorkflowResult<bool> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            return Ok(!self.parse_unary()?);
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> WorkflowResult<bool> {
        match self.next() {
            Some(Token::LParen) => {
                let value = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(WorkflowError::Validation(
                        "missing ')' in conditional expression".to_string(),
                    )),
                }
            }
            Some(Token::Operand(text, quoted)) => {
                let left = self.resolve(&text, quoted);
                match self.peek() {
                    Some(Token::Eq) | Some(Token::Ne) => {
                        let negate = self.next() == Some(Token::Ne);
                        match self.next() {
                            Some(Token::Operand(rhs, rhs_quoted)) => {
                                let right = self.resolve(&rhs, rhs_quoted);
                                Ok((left == right) != negate)
                            }
                            _ => Err(WorkflowError::Validation(
                                "expected operand after comparison operator".to_string(),
                            )),
                        }
                    }
                    _ => Ok(left.eq_ignore_ascii_case("true")),
                }
            }
            other => Err(WorkflowError::Validation(format!(
                "unexpected token {:?} in conditional expression",
                other
            ))),
        }
    }

    fn resolve(&self, text: &str, quoted: bool) -> String {
        if quoted {
            text.to_string()
        } else {
            self.context.get(text).unwrap_or_default().to_string()
        }
    }
}

/// Evaluates a boolean expression against an execution context.
///
/// Unknown variables resolve to the empty string; malformed expressions
/// are a validation error and fail the task terminally.
pub fn evaluate_condition(
    expression: &str,
    context: &ExecutionContext,
) -> WorkflowResult<bool> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(WorkflowError::Validation(
            "empty conditional expression".to_string(),
        ));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        context,
    };
    let value = parser.parse_or()?;

    if parser.pos != parser.tokens.len() {
        return Err(WorkflowError::Validation(
            "trailing tokens in conditional expression".to_string(),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        ctx.set("env", "production");
        ctx.set("approved", "true");
        ctx.set("count", "3");
        ctx
    }

    #[test]
    fn test_equality() {
        let ctx = context();
        assert!(evaluate_condition("env == 'production'", &ctx).unwrap());
        assert!(!evaluate_condition("env == 'staging'", &ctx).unwrap());
        assert!(evaluate_condition("env != 'staging'", &ctx).unwrap());
    }

    #[test]
    fn test_logical_operators() {
        let ctx = context();
        assert!(evaluate_condition("env == 'production' && count == '3'", &ctx).unwrap());
        assert!(evaluate_condition("env == 'staging' || approved == 'true'", &ctx).unwrap());
        assert!(!evaluate_condition("env == 'staging' && approved == 'true'", &ctx).unwrap());
    }

    #[test]
    fn test_negation_and_parentheses() {
        let ctx = context();
        assert!(evaluate_condition("!(env == 'staging')", &ctx).unwrap());
        assert!(
            evaluate_condition("(env == 'staging' || count == '3') && approved", &ctx).unwrap()
        );
    }

    #[test]
    fn test_bare_operand_truthiness() {
        let ctx = context();
        assert!(evaluate_condition("approved", &ctx).unwrap());
        assert!(!evaluate_condition("env", &ctx).unwrap());
        assert!(!evaluate_condition("missing", &ctx).unwrap());
    }

    #[test]
    fn test_unknown_variable_is_empty() {
        let ctx = context();
        assert!(evaluate_condition("missing == ''", &ctx).unwrap());
    }

    #[test]
    fn test_double_quotes() {
        let ctx = context();
        assert!(evaluate_condition(r#"env == "production""#, &ctx).unwrap());
    }

    #[test]
    fn test_malformed_expressions() {
        let ctx = context();
        assert!(evaluate_condition("", &ctx).is_err());
        assert!(evaluate_condition("env ==", &ctx).is_err());
        assert!(evaluate_condition("env = 'x'", &ctx).is_err());
        assert!(evaluate_condition("(env == 'x'", &ctx).is_err());
        assert!(evaluate_condition("env == 'x' extra", &ctx).is_err());
        assert!(evaluate_condition("env == 'unterminated", &ctx).is_err());
    }
}
