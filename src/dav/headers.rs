//! WebDAV 请求头解析：Depth、Timeout、If、Destination、Lock-Token。

use axum::http::HeaderMap;
use std::time::Duration;

use crate::locks::Condition;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

/// 请求头格式错误。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidHeader(pub &'static str);

/// Parses `Depth`; a missing header yields `default`.
pub fn parse_depth(headers: &HeaderMap, default: Depth) -> Result<Depth, InvalidHeader> {
    let Some(value) = headers.get("depth") else {
        return Ok(default);
    };
    match value.to_str().map_err(|_| InvalidHeader("Depth"))? {
        "0" => Ok(Depth::Zero),
        "1" => Ok(Depth::One),
        "infinity" => Ok(Depth::Infinity),
        _ => Err(InvalidHeader("Depth")),
    }
}

const MAX_TIMEOUT_SECS: u64 = (1 << 32) - 1;

/// Parses `Timeout`. `None` means infinite; only the first listed value is used.
pub fn parse_timeout(headers: &HeaderMap) -> Result<Option<Duration>, InvalidHeader> {
    let Some(value) = headers.get("timeout") else {
        return Ok(None);
    };
    let raw = value.to_str().map_err(|_| InvalidHeader("Timeout"))?;
    let first = raw.split(',').next().unwrap_or_default().trim();
    if first.is_empty() || first == "Infinite" {
        return Ok(None);
    }
    let secs = first
        .strip_prefix("Second-")
        .filter(|digits| digits.starts_with(|c: char| c.is_ascii_digit()))
        .and_then(|digits| digits.parse::<u64>().ok())
        .filter(|secs| *secs <= MAX_TIMEOUT_SECS)
        .ok_or(InvalidHeader("Timeout"))?;
    Ok(Some(Duration::from_secs(secs)))
}

/// One parenthesised condition list, optionally tagged with a resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IfList {
    pub resource_tag: Option<String>,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Open,
    Close,
    Not,
    Word(&'a str),
    Angle(&'a str),
    Square(&'a str),
    Other,
}

fn lex(input: &str) -> Option<(Token<'_>, &str)> {
    let s = input.trim_start_matches([' ', '\t']);
    let first = s.chars().next()?;
    let word_end = s
        .find([' ', '\t', '(', ')', '<', '>', '[', ']'])
        .unwrap_or(s.len());
    if word_end > 0 {
        let (word, rest) = s.split_at(word_end);
        if word == "Not" {
            return Some((Token::Not, rest));
        }
        return Some((Token::Word(word), rest));
    }
    let rest = &s[first.len_utf8()..];
    match first {
        '(' => Some((Token::Open, rest)),
        ')' => Some((Token::Close, rest)),
        '<' => {
            let end = rest.find('>')?;
            Some((Token::Angle(&rest[..end]), &rest[end + 1..]))
        }
        '[' => {
            let end = rest.find(']')?;
            Some((Token::Square(&rest[..end]), &rest[end + 1..]))
        }
        _ => Some((Token::Other, rest)),
    }
}

fn parse_condition(input: &str) -> Option<(Condition, &str)> {
    let mut condition = Condition::default();
    let (mut token, mut rest) = lex(input)?;
    if token == Token::Not {
        condition.not = true;
        (token, rest) = lex(rest)?;
    }
    match token {
        Token::Word(value) | Token::Angle(value) => condition.token = Some(value.to_string()),
        Token::Square(value) => condition.etag = Some(value.to_string()),
        _ => return None,
    }
    Some((condition, rest))
}

fn parse_list(input: &str) -> Option<(IfList, &str)> {
    let (token, mut s) = lex(input)?;
    if token != Token::Open {
        return None;
    }
    let mut list = IfList::default();
    loop {
        if let Some((Token::Close, rest)) = lex(s) {
            if list.conditions.is_empty() {
                return None;
            }
            return Some((list, rest));
        }
        let (condition, rest) = parse_condition(s)?;
        list.conditions.push(condition);
        s = rest;
    }
}

/// Parses an `If` header into its condition lists. `None` on malformed input.
pub fn parse_if(raw: &str) -> Option<Vec<IfList>> {
    let mut s = raw.trim();
    let mut lists = Vec::new();
    match lex(s)?.0 {
        Token::Open => loop {
            let (list, rest) = parse_list(s)?;
            lists.push(list);
            if rest.trim().is_empty() {
                return Some(lists);
            }
            s = rest;
        },
        Token::Angle(_) => {
            let mut tag: Option<String> = None;
            let mut tagged_at = 0;
            loop {
                let (token, rest) = lex(s)?;
                match token {
                    Token::Angle(value) => {
                        // 资源标签后必须至少跟一个列表。
                        if tag.is_some() && lists.len() == tagged_at {
                            return None;
                        }
                        tag = Some(value.to_string());
                        tagged_at = lists.len();
                        s = rest;
                    }
                    Token::Open => {
                        let (mut list, rest) = parse_list(s)?;
                        list.resource_tag = tag.clone();
                        lists.push(list);
                        if rest.trim().is_empty() {
                            return Some(lists);
                        }
                        s = rest;
                    }
                    _ => return None,
                }
            }
        }
        _ => None,
    }
}

/// `Lock-Token: <token>` 去掉尖括号。
pub fn parse_lock_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("lock-token")?.to_str().ok()?.trim();
    raw.strip_prefix('<')?
        .strip_suffix('>')
        .map(ToString::to_string)
}

/// Raw `Overwrite` header value, if any.
pub fn overwrite_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("overwrite").and_then(|value| value.to_str().ok())
}

#[derive(Debug, PartialEq, Eq)]
pub enum Destination {
    /// Host 与本次请求一致（或未给出）时的 URI path 部分。
    Path(String),
    OtherHost,
}

/// Parses `Destination`; accepts absolute urls and absolute paths.
pub fn parse_destination(raw: &str, request_host: Option<&str>) -> Option<Destination> {
    let raw = raw.trim();
    if raw.starts_with('/') {
        let path = raw.split(['?', '#']).next().unwrap_or_default();
        return Some(Destination::Path(path.to_string()));
    }
    let url = url::Url::parse(raw).ok()?;
    if url.host_str().is_some()
        && let Some(expected) = request_host
        && !same_host(&url, expected)
    {
        return Some(Destination::OtherHost);
    }
    Some(Destination::Path(url.path().to_string()))
}

/// If 头里的资源标签；带主机的标签须与请求的 Host 一致。
pub fn split_resource_tag(tag: &str, request_host: Option<&str>) -> Option<Destination> {
    if tag.starts_with('/') {
        return Some(Destination::Path(tag.to_string()));
    }
    let url = url::Url::parse(tag).ok()?;
    if url.host_str().is_some() && !request_host.is_some_and(|host| same_host(&url, host)) {
        return Some(Destination::OtherHost);
    }
    Some(Destination::Path(url.path().to_string()))
}

/// Compares the url's authority with a `Host` header, filling in the
/// scheme's default port on both sides.
fn same_host(url: &url::Url, request_host: &str) -> bool {
    let Ok(expected) = url::Url::parse(&format!("{}://{request_host}/", url.scheme())) else {
        return false;
    };
    let hosts_match = match (url.host_str(), expected.host_str()) {
        (Some(host), Some(expected)) => host.eq_ignore_ascii_case(expected),
        _ => false,
    };
    hosts_match && url.port_or_known_default() == expected.port_or_known_default()
}
