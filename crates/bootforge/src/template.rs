//! Placeholder rendering for the container image definition.
//!
//! Scalars are written `{{name}}`. A list is repeated with
//! `{{#name}} ... {{.}} ... {{/name}}`, where `{{.}}` is the current item.
//! Sections do not nest.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

#[derive(Debug, Default, Clone)]
pub struct TemplateVars {
    scalars: BTreeMap<String, String>,
    lists: BTreeMap<String, Vec<String>>,
}

impl TemplateVars {
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.scalars.insert(key.to_string(), value.into());
        self
    }

    pub fn set_list(&mut self, key: &str, items: Vec<String>) -> &mut Self {
        self.lists.insert(key.to_string(), items);
        self
    }
}

enum Token<'a> {
    Text(&'a str),
    Var(&'a str),
    Open(&'a str),
    Close(&'a str),
}

fn tokenize(src: &str) -> Result<Vec<Token<'_>>> {
    let mut out = Vec::new();
    let mut rest = src;
    let mut offset = 0usize;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            out.push(Token::Text(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(Error::template(format!(
                "unterminated tag at byte {}",
                offset + start
            )));
        };
        let tag = after[..end].trim();
        if tag.is_empty() {
            return Err(Error::template(format!(
                "empty tag at byte {}",
                offset + start
            )));
        }
        out.push(if let Some(name) = tag.strip_prefix('#') {
            Token::Open(name.trim())
        } else if let Some(name) = tag.strip_prefix('/') {
            Token::Close(name.trim())
        } else {
            Token::Var(tag)
        });
        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    if !rest.is_empty() {
        out.push(Token::Text(rest));
    }
    Ok(out)
}

pub fn render(src: &str, vars: &TemplateVars) -> Result<String> {
    let tokens = tokenize(src)?;
    let mut out = String::with_capacity(src.len());
    let mut i = 0usize;
    while i < tokens.len() {
        match tokens[i] {
            Token::Text(t) => out.push_str(t),
            Token::Var(name) => out.push_str(scalar(vars, name)?),
            Token::Close(name) => {
                return Err(Error::template(format!(
                    "section close '{{{{/{name}}}}}' without matching open"
                )));
            }
            Token::Open(name) => {
                let items = vars
                    .lists
                    .get(name)
                    .ok_or_else(|| Error::template(format!("unknown section '{name}'")))?;
                let body_start = i + 1;
                let mut j = body_start;
                loop {
                    match tokens.get(j) {
                        None => {
                            return Err(Error::template(format!(
                                "section '{name}' is never closed"
                            )));
                        }
                        Some(Token::Open(inner)) => {
                            return Err(Error::template(format!(
                                "nested section '{inner}' inside '{name}' is not supported"
                            )));
                        }
                        Some(Token::Close(close)) if *close == name => break,
                        Some(Token::Close(other)) => {
                            return Err(Error::template(format!(
                                "section '{name}' closed by '{other}'"
                            )));
                        }
                        Some(_) => j += 1,
                    }
                }
                for item in items {
                    for tok in &tokens[body_start..j] {
                        match tok {
                            Token::Text(t) => out.push_str(t),
                            Token::Var(".") => out.push_str(item),
                            Token::Var(v) => out.push_str(scalar(vars, v)?),
                            Token::Open(_) | Token::Close(_) => {}
                        }
                    }
                }
                i = j;
            }
        }
        i += 1;
    }
    Ok(out)
}

fn scalar<'a>(vars: &'a TemplateVars, name: &str) -> Result<&'a str> {
    if name == "." {
        return Err(Error::template("'{{.}}' used outside of a section"));
    }
    vars.scalars
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| Error::template(format!("unknown placeholder '{name}'")))
}
