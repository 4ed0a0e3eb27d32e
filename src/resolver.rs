//! 上传端点的 URL 模板与存储路径模板。
//!
//! 端点由 URL 模板（如 `/user/{username}/uploads`）、存储根目录与可选的
//! 子路径模板（如 `{username}`）组成。占位符的值取自请求 URL，写入文件系统
//! 之前逐一校验，解析出的存储位置始终位于根目录之内。

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::error::{ConfigError, TusError};

/// 上传 ID 所在路径段的占位符名。
pub const UPLOAD_ID_CAPTURE: &str = "upload_id";

/// 除 RFC 3986 非保留字符外全部编码。
const URL_SEGMENT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// 占位符名到请求 URL 中取值的映射。
pub type Bindings = HashMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Capture(String),
}

/// 由字面量与 `{name}` 占位符组成的模板。
#[derive(Clone, Debug)]
pub struct Template {
    source: String,
    pieces: Vec<Piece>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidTemplate {
            template: source.to_string(),
            reason: reason.to_string(),
        };

        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars();
        while let Some(ch) = chars.next() {
            match ch {
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) if c.is_ascii_alphanumeric() || c == '_' => name.push(c),
                            Some(_) => return Err(invalid("invalid character in placeholder")),
                            None => return Err(invalid("unclosed placeholder")),
                        }
                    }
                    if name.is_empty() {
                        return Err(invalid("empty placeholder"));
                    }
                    if !literal.is_empty() {
                        pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                    }
                    pieces.push(Piece::Capture(name));
                }
                '}' => return Err(invalid("unmatched '}'")),
                _ => literal.push(ch),
            }
        }
        if !literal.is_empty() {
            pieces.push(Piece::Literal(literal));
        }

        let mut seen = BTreeSet::new();
        for piece in &pieces {
            if let Piece::Capture(name) = piece
                && !seen.insert(name.as_str())
            {
                return Err(invalid("placeholder used twice"));
            }
        }

        Ok(Self {
            source: source.to_string(),
            pieces,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn captures(&self) -> impl Iterator<Item = &str> {
        self.pieces.iter().filter_map(|piece| match piece {
            Piece::Capture(name) => Some(name.as_str()),
            Piece::Literal(_) => None,
        })
    }

    /// 去掉占位符名后的模板形状。
    pub fn shape(&self) -> String {
        self.pieces
            .iter()
            .map(|piece| match piece {
                Piece::Literal(text) => text.as_str(),
                Piece::Capture(_) => "{}",
            })
            .collect()
    }

    pub fn is_constant(&self) -> bool {
        self.captures().next().is_none()
    }

    /// 替换所有占位符，拒绝不安全的取值。
    pub fn render(&self, bindings: &Bindings) -> Result<String, TusError> {
        self.render_with(bindings, |value| value.to_string())
    }

    fn render_with(
        &self,
        bindings: &Bindings,
        encode: impl Fn(&str) -> String,
    ) -> Result<String, TusError> {
        let mut out = String::with_capacity(self.source.len());
        for piece in &self.pieces {
            match piece {
                Piece::Literal(text) => out.push_str(text),
                Piece::Capture(name) => {
                    let value = bindings
                        .get(name)
                        .ok_or_else(|| TusError::MissingBinding(name.clone()))?;
                    check_binding(name, value)?;
                    out.push_str(&encode(value));
                }
            }
        }
        Ok(out)
    }

    /// 目录名与单段模板的宽松匹配：字面前缀与后缀一致即可。
    fn matches_name(&self, name: &str) -> bool {
        if name.starts_with('.') {
            return false;
        }
        let prefix = match self.pieces.first() {
            Some(Piece::Literal(text)) => text.as_str(),
            _ => "",
        };
        let suffix = match self.pieces.last() {
            Some(Piece::Literal(text)) if self.pieces.len() > 1 => text.as_str(),
            _ => "",
        };
        name.len() > prefix.len() + suffix.len()
            && name.starts_with(prefix)
            && name.ends_with(suffix)
    }
}

/// 拒绝可能越出存储根目录或与隐藏记录目录冲突的取值。
pub fn check_binding(name: &str, value: &str) -> Result<(), TusError> {
    let rejected = value.is_empty()
        || value.starts_with('.')
        || value.contains("..")
        || value.contains(['/', '\\', '\0', ':']);
    if rejected {
        return Err(TusError::PathTraversalRejected(format!(
            "{name}={value:?}"
        )));
    }
    Ok(())
}

/// 解析后的存储目录及其所属根目录。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StorageLocation {
    root: PathBuf,
    path: PathBuf,
}

impl StorageLocation {
    pub fn new(root: PathBuf, path: PathBuf) -> Self {
        Self { root, path }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// 已挂载的上传端点及其策略。
#[derive(Clone, Debug)]
pub struct UploadEndpoint {
    url: Template,
    root: PathBuf,
    subpath: Vec<Template>,
    /// 未完成上传的闲置过期时间，0 表示不过期。
    pub retention: Duration,
    /// 允许声明的最大长度，0 表示不限制。
    pub max_size: u64,
    pub allow_overwrite: bool,
    /// 完成后保留上传记录，`HEAD` 仍可查询。
    pub retain_completed: bool,
}

impl UploadEndpoint {
    pub fn new(url: &str, root: PathBuf, subpath: Option<&str>) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidTemplate {
            template: url.to_string(),
            reason: reason.to_string(),
        };

        if !url.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }
        if url.len() > 1 && url.ends_with('/') {
            return Err(invalid("must not end with '/'"));
        }
        let url_template = Template::parse(url)?;
        for segment in url.split('/').skip(1) {
            let segment_template = Template::parse(segment)?;
            if !segment_template.is_constant() && segment_template.pieces.len() != 1 {
                return Err(invalid("a placeholder must occupy a whole segment"));
            }
        }
        if url_template.captures().any(|name| name == UPLOAD_ID_CAPTURE) {
            return Err(ConfigError::ReservedPlaceholder(UPLOAD_ID_CAPTURE.into()));
        }

        let mut segments = Vec::new();
        if let Some(subpath) = subpath {
            let trimmed = subpath.trim_matches('/');
            for segment in trimmed.split('/').filter(|s| !s.is_empty()) {
                if segment == "." || segment == ".." || segment.contains('\\') {
                    return Err(ConfigError::InvalidTemplate {
                        template: subpath.to_string(),
                        reason: "relative components are not allowed".into(),
                    });
                }
                let template = Template::parse(segment)?;
                for name in template.captures() {
                    if !url_template.captures().any(|captured| captured == name) {
                        return Err(ConfigError::UnboundPlaceholder {
                            name: name.to_string(),
                            url: url.to_string(),
                        });
                    }
                }
                segments.push(template);
            }
        }

        Ok(Self {
            url: url_template,
            root,
            subpath: segments,
            retention: Duration::ZERO,
            max_size: 0,
            allow_overwrite: false,
            retain_completed: true,
        })
    }

    pub fn url_template(&self) -> &str {
        self.url.as_str()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 上传资源的路由模式。
    pub fn resource_pattern(&self) -> String {
        let base = self.url.as_str().trim_end_matches('/');
        format!("{base}/{{{UPLOAD_ID_CAPTURE}}}")
    }

    /// 创建路由与资源路由的形状，形状相同的端点不能同时挂载。
    pub fn route_shapes(&self) -> [String; 2] {
        let collection = self.url.shape();
        let resource = format!("{}/{{}}", collection.trim_end_matches('/'));
        [collection, resource]
    }

    /// 根据占位符取值解析存储位置。
    pub fn resolve(&self, bindings: &Bindings) -> Result<StorageLocation, TusError> {
        let mut path = self.root.clone();
        for segment in &self.subpath {
            path.push(segment.render(bindings)?);
        }
        Ok(StorageLocation::new(self.root.clone(), path))
    }

    /// 绑定占位符后的端点地址。
    pub fn url_for(&self, bindings: &Bindings) -> Result<String, TusError> {
        self.url.render_with(bindings, encode_segment)
    }

    pub fn resource_url(&self, bindings: &Bindings, id: &str) -> Result<String, TusError> {
        let base = self.url_for(bindings)?;
        Ok(format!("{}/{id}", base.trim_end_matches('/')))
    }

    /// 列出该端点可能写入过的所有存储位置。
    pub async fn discover_locations(&self) -> io::Result<Vec<StorageLocation>> {
        let mut current = vec![self.root.clone()];
        for segment in &self.subpath {
            let mut next = Vec::new();
            for dir in current {
                if segment.is_constant() {
                    next.push(dir.join(segment.as_str()));
                    continue;
                }
                let mut entries = match fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(err),
                };
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if entry.file_type().await?.is_dir() && segment.matches_name(&name) {
                        next.push(entry.path());
                    }
                }
            }
            current = next;
        }

        let mut locations = Vec::new();
        for path in current {
            if fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
                locations.push(StorageLocation::new(self.root.clone(), path));
            }
        }
        Ok(locations)
    }
}

fn encode_segment(value: &str) -> String {
    utf8_percent_encode(value, URL_SEGMENT_ENCODE_SET).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn bindings(pairs: &[(&str, &str)]) -> Bindings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn constant_endpoint_resolves_to_root() {
        let endpoint = UploadEndpoint::new("/uploads", PathBuf::from("/srv/up"), None)
            .expect("endpoint");
        let location = endpoint.resolve(&Bindings::new()).expect("resolve");
        assert_eq!(location.path(), Path::new("/srv/up"));
        assert_eq!(endpoint.resource_pattern(), "/uploads/{upload_id}");
    }

    #[test]
    fn resolve_is_deterministic() {
        let endpoint = UploadEndpoint::new(
            "/user/{username}/uploads",
            PathBuf::from("/srv/up"),
            Some("{username}"),
        )
        .expect("endpoint");
        let values = bindings(&[("username", "playpauseandstop")]);
        let first = endpoint.resolve(&values).expect("resolve");
        let second = endpoint.resolve(&values).expect("resolve");
        assert_eq!(first, second);
        assert_eq!(first.path(), Path::new("/srv/up/playpauseandstop"));
        assert_eq!(
            endpoint.resource_url(&values, "abc").expect("url"),
            "/user/playpauseandstop/uploads/abc"
        );
    }

    #[test]
    fn url_only_captures_share_the_root() {
        let endpoint =
            UploadEndpoint::new("/user/{username}/uploads", PathBuf::from("/srv/up"), None)
                .expect("endpoint");
        let location = endpoint
            .resolve(&bindings(&[("username", "someone")]))
            .expect("resolve");
        assert_eq!(location.path(), Path::new("/srv/up"));
    }

    #[test]
    fn traversal_values_are_rejected() {
        let endpoint = UploadEndpoint::new(
            "/user/{username}/uploads",
            PathBuf::from("/srv/up"),
            Some("users/{username}"),
        )
        .expect("endpoint");
        for value in ["../etc", "..", "a/b", ".hidden", "a\\b", ""] {
            let result = endpoint.resolve(&bindings(&[("username", value)]));
            assert!(
                matches!(result, Err(TusError::PathTraversalRejected(_))),
                "{value:?} should be rejected"
            );
        }
    }

    #[test]
    fn missing_binding_is_reported() {
        let endpoint = UploadEndpoint::new(
            "/user/{username}/uploads",
            PathBuf::from("/srv/up"),
            Some("{username}"),
        )
        .expect("endpoint");
        let result = endpoint.resolve(&Bindings::new());
        assert!(matches!(result, Err(TusError::MissingBinding(name)) if name == "username"));
    }

    #[test]
    fn storage_placeholder_must_be_captured_by_url() {
        let result = UploadEndpoint::new("/uploads", PathBuf::from("/srv"), Some("{username}"));
        assert!(matches!(
            result,
            Err(ConfigError::UnboundPlaceholder { name, .. }) if name == "username"
        ));
    }

    #[test]
    fn url_templates_are_validated() {
        assert!(UploadEndpoint::new("uploads", PathBuf::from("/srv"), None).is_err());
        assert!(UploadEndpoint::new("/uploads/", PathBuf::from("/srv"), None).is_err());
        assert!(UploadEndpoint::new("/u-{name}/up", PathBuf::from("/srv"), None).is_err());
        assert!(UploadEndpoint::new("/u/{name", PathBuf::from("/srv"), None).is_err());
        assert!(matches!(
            UploadEndpoint::new("/u/{upload_id}", PathBuf::from("/srv"), None),
            Err(ConfigError::ReservedPlaceholder(_))
        ));
        assert!(UploadEndpoint::new("/u", PathBuf::from("/srv"), Some("../x")).is_err());
    }

    #[test]
    fn url_values_are_percent_encoded() {
        let endpoint =
            UploadEndpoint::new("/user/{username}/uploads", PathBuf::from("/srv"), None)
                .expect("endpoint");
        let url = endpoint
            .url_for(&bindings(&[("username", "a b")]))
            .expect("url");
        assert_eq!(url, "/user/a%20b/uploads");
        let url = endpoint
            .url_for(&bindings(&[("username", "zoë~x")]))
            .expect("url");
        assert_eq!(url, "/user/zo%C3%AB~x/uploads");
    }

    #[test]
    fn route_shapes_ignore_capture_names() {
        let a = UploadEndpoint::new("/u/{a}/x", PathBuf::from("/srv"), None).expect("endpoint");
        let b = UploadEndpoint::new("/u/{b}/x", PathBuf::from("/srv"), None).expect("endpoint");
        assert_eq!(a.route_shapes(), b.route_shapes());
        assert_eq!(a.route_shapes()[1], "/u/{}/x/{}");
    }

    #[tokio::test]
    async fn discover_walks_placeholder_directories() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        std::fs::create_dir_all(root.join("alice/files")).expect("mkdir");
        std::fs::create_dir_all(root.join("bob/files")).expect("mkdir");
        std::fs::create_dir_all(root.join("carol")).expect("mkdir");
        std::fs::create_dir_all(root.join(".tus")).expect("mkdir");

        let endpoint = UploadEndpoint::new(
            "/user/{username}/uploads",
            root.clone(),
            Some("{username}/files"),
        )
        .expect("endpoint");
        let mut found: Vec<_> = endpoint
            .discover_locations()
            .await
            .expect("discover")
            .into_iter()
            .map(|location| location.path().to_path_buf())
            .collect();
        found.sort();
        assert_eq!(found, vec![root.join("alice/files"), root.join("bob/files")]);
    }
}
