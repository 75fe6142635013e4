//! Command line tokenizer
//!
//! Only enough of POSIX shell syntax to find words and command boundaries:
//! - Quotes: `'literal'`, `"with \" escapes"`
//! - Backslash escapes and `\`-newline continuations
//! - Operators: `|`, `||`, `&`, `&&`, `;`, newline, redirects
//!
//! The remote shell does the real parsing; this is used to classify a
//! submitted line and to find the word under the cursor.

use anyhow::{bail, Result};

/// Command separators and redirects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Pipe,
    OrIf,
    AndIf,
    Background,
    Separator,
    /// `>`, `>>`, `<`: the next word is the target
    Redirect,
    /// `2>&1` and friends, no target word
    Duplicate,
}

impl Operator {
    /// Ends one command and starts the next.
    pub fn starts_command(self) -> bool {
        !matches!(self, Operator::Redirect | Operator::Duplicate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word(String),
    Operator(Operator),
}

/// Words of the first command on the line, up to the first separator.
pub fn first_command(input: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut after_redirect = false;
    for token in tokenize(input)? {
        match token {
            // redirect target, not an argument
            Token::Word(_) if after_redirect => after_redirect = false,
            Token::Word(word) => words.push(word),
            Token::Operator(Operator::Redirect) => after_redirect = true,
            Token::Operator(op) if !op.starts_command() => {}
            Token::Operator(_) => break,
        }
    }
    Ok(words)
}

pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }

    let mut tokens = Vec::new();
    let mut word = String::new();
    // a word can be an empty quoted string
    let mut in_word = false;
    let mut quote = Quote::None;

    fn finish_word(tokens: &mut Vec<Token>, word: &mut String, in_word: &mut bool) {
        if *in_word {
            tokens.push(Token::Word(std::mem::take(word)));
            *in_word = false;
        }
    }

    let chars: Vec<char> = input.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();

        match quote {
            Quote::Single => {
                if ch == '\'' {
                    quote = Quote::None;
                } else {
                    word.push(ch);
                }
            }
            Quote::Double => match ch {
                '"' => quote = Quote::None,
                '\\' if matches!(next, Some('"' | '\\' | '$' | '`')) => {
                    word.extend(next);
                    i += 1;
                }
                '\\' if next == Some('\n') => i += 1,
                c => word.push(c),
            },
            Quote::None => match ch {
                '\'' => {
                    quote = Quote::Single;
                    in_word = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_word = true;
                }
                '\\' => match next {
                    Some('\n') => i += 1,
                    Some(c) => {
                        word.push(c);
                        in_word = true;
                        i += 1;
                    }
                    None => {
                        word.push('\\');
                        in_word = true;
                    }
                },
                '\n' | ';' => {
                    finish_word(&mut tokens, &mut word, &mut in_word);
                    tokens.push(Token::Operator(Operator::Separator));
                }
                c if c.is_whitespace() => finish_word(&mut tokens, &mut word, &mut in_word),
                '|' => {
                    finish_word(&mut tokens, &mut word, &mut in_word);
                    if next == Some('|') {
                        tokens.push(Token::Operator(Operator::OrIf));
                        i += 1;
                    } else {
                        if next == Some('&') {
                            i += 1;
                        }
                        tokens.push(Token::Operator(Operator::Pipe));
                    }
                }
                '&' => {
                    finish_word(&mut tokens, &mut word, &mut in_word);
                    if next == Some('&') {
                        tokens.push(Token::Operator(Operator::AndIf));
                        i += 1;
                    } else {
                        tokens.push(Token::Operator(Operator::Background));
                    }
                }
                '>' | '<' => {
                    // `2>` and friends: a bare fd number belongs to the redirect
                    if in_word && !word.is_empty() && word.chars().all(|c| c.is_ascii_digit()) {
                        word.clear();
                        in_word = false;
                    }
                    finish_word(&mut tokens, &mut word, &mut in_word);
                    while matches!(chars.get(i + 1), Some('>' | '&' | '<')) {
                        i += 1;
                    }
                    // `2>&1`: the fd after `>&` is part of the operator
                    if chars[i] == '&' {
                        while chars.get(i + 1).is_some_and(|c| c.is_ascii_digit() || *c == '-') {
                            i += 1;
                        }
                        tokens.push(Token::Operator(Operator::Duplicate));
                    } else {
                        tokens.push(Token::Operator(Operator::Redirect));
                    }
                }
                c => {
                    word.push(c);
                    in_word = true;
                }
            },
        }

        i += 1;
    }

    if quote != Quote::None {
        bail!("Unclosed quote");
    }

    finish_word(&mut tokens, &mut word, &mut in_word);

    Ok(tokens)
}
