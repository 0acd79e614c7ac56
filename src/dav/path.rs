//! 客户端可见的虚拟路径。

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use std::fmt;

/// 路径段编码时需要转义的字符。
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}')
    .add(b'/')
    .add(b'\\');

/// Slash-delimited path below the mount point. Stored without leading or
/// trailing slash; the root is the empty string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualPath(String);

impl VirtualPath {
    pub fn root() -> Self {
        Self(String::new())
    }

    /// 规范化已解码的路径：去掉空段和 `.`，`..` 回退一级，越过根时返回 None。
    pub fn parse(raw: &str) -> Option<Self> {
        let mut segments: Vec<&str> = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop()?;
                }
                other => segments.push(other),
            }
        }
        Some(Self(segments.join("/")))
    }

    /// 从请求 URI 的 path 部分解析：百分号解码并去掉挂载前缀。
    pub fn from_uri_path(uri_path: &str, prefix: &str) -> Option<Self> {
        let decoded = percent_decode_str(uri_path).decode_utf8().ok()?;
        let prefix = prefix.trim_end_matches('/');
        let rest = if prefix.is_empty() {
            decoded.as_ref()
        } else {
            let rest = decoded.strip_prefix(prefix)?;
            if !(rest.is_empty() || rest.starts_with('/')) {
                return None;
            }
            rest
        };
        Self::parse(rest)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|segment| !segment.is_empty())
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// 父路径；根目录没有父路径。
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(match self.0.rsplit_once('/') {
            Some((parent, _)) => Self(parent.to_string()),
            None => Self::root(),
        })
    }

    /// 最后一段名称；根目录为空串。
    pub fn name(&self) -> &str {
        match self.0.rsplit_once('/') {
            Some((_, name)) => name,
            None => &self.0,
        }
    }

    pub fn join(&self, name: &str) -> Self {
        if self.is_root() {
            Self(name.to_string())
        } else {
            Self(format!("{}/{}", self.0, name))
        }
    }

    /// 前 `n` 段组成的祖先路径。
    pub fn prefix(&self, n: usize) -> Self {
        Self(self.segments().take(n).collect::<Vec<_>>().join("/"))
    }

    /// `self` 与 `ancestor` 相同或位于其下。
    pub fn is_within(&self, ancestor: &VirtualPath) -> bool {
        if ancestor.is_root() || self == ancestor {
            return true;
        }
        self.0.starts_with(&ancestor.0) && self.0.as_bytes().get(ancestor.0.len()) == Some(&b'/')
    }

    /// 把 `from` 前缀替换为 `to`。
    pub fn rebase(&self, from: &VirtualPath, to: &VirtualPath) -> Self {
        if self == from {
            return to.clone();
        }
        let rest = if from.is_root() {
            self.0.as_str()
        } else {
            self.0[from.0.len()..].trim_start_matches('/')
        };
        to.join(rest)
    }

    /// Percent-encoded href under `prefix`; folders end with a slash.
    pub fn href(&self, prefix: &str, is_folder: bool) -> String {
        let mut href = prefix.trim_end_matches('/').to_string();
        for segment in self.segments() {
            href.push('/');
            href.extend(utf8_percent_encode(segment, SEGMENT));
        }
        if is_folder || href.is_empty() {
            href.push('/');
        }
        href
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}
