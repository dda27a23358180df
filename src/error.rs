use std::path::{Path, PathBuf};

/// 应用程序错误类型
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 文件操作错误
    #[error("文件错误: {0}")]
    File(#[from] FileError),
    /// 提供方池错误
    #[error("提供方错误: {0}")]
    Pool(#[from] PoolError),
    /// 单次请求错误
    #[error("API错误: {0}")]
    Request(#[from] RequestError),
    /// 任务状态错误
    #[error("任务错误: {0}")]
    Task(#[from] TaskError),
}

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 读取配置文件失败
    #[error("无法读取配置文件 {}: {source}", path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// 写入默认配置失败
    #[error("无法写入配置文件 {}: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// TOML 解析失败
    #[error("配置文件解析失败 {}: {source}", path.display())]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    /// TOML 序列化失败
    #[error("配置序列化失败: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    /// 字段取值非法
    #[error("配置项 {field} 非法: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// 文件操作错误
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    /// 目录不存在
    #[error("目录不存在: {}", path.display())]
    DirectoryNotFound { path: PathBuf },
    /// 缺少必要的输入文件
    #[error("在目录 {} 中未找到{what}", dir.display())]
    InputMissing { dir: PathBuf, what: &'static str },
    /// 读取文件失败
    #[error("读取文件失败 ({}): {source}", path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// 写入文件失败
    #[error("写入文件失败 ({}): {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// TOML 解析失败
    #[error("TOML解析失败 ({}): {source}", path.display())]
    TomlParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    /// TOML 序列化失败
    #[error("TOML序列化失败 ({}): {source}", path.display())]
    TomlSerializeFailed {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
    /// JSON 读写失败
    #[error("JSON处理失败 ({}): {source}", path.display())]
    JsonFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// 提供方池错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// 当前没有任何可用的提供方
    #[error("没有可用的 API 提供方")]
    NoProviders,
    /// 校验后没有任何提供方存活
    #[error("所有 API 提供方校验失败 (共检查 {checked} 个)")]
    NoValidProviders { checked: usize },
}

/// 单次请求的错误分类
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RateLimit,
    Timeout,
    ServerError,
    ClientError,
    Unknown,
}

/// 单次判定请求错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// 请求频率限制
    #[error("请求频率受限 (HTTP 429): {message}")]
    RateLimited { message: String },
    /// 请求超时
    #[error("请求超时 ({secs} 秒)")]
    Timeout { secs: u64 },
    /// 服务端错误 (5xx)
    #[error("服务端错误 HTTP {status}: {message}")]
    Server { status: u16, message: String },
    /// 客户端/鉴权错误 (4xx)
    #[error("客户端错误 HTTP {status}: {message}")]
    Client { status: u16, message: String },
    /// 返回内容为空
    #[error("返回内容为空")]
    EmptyContent,
    /// 其他错误
    #[error("请求失败: {0}")]
    Other(String),
}

impl RequestError {
    /// 根据 HTTP 状态码构造错误
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => RequestError::RateLimited { message },
            500..=599 => RequestError::Server { status, message },
            400..=499 => RequestError::Client { status, message },
            _ => RequestError::Other(format!("HTTP {}: {}", status, message)),
        }
    }

    /// 重试循环使用的错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            RequestError::RateLimited { .. } => ErrorKind::RateLimit,
            RequestError::Timeout { .. } => ErrorKind::Timeout,
            RequestError::Server { .. } => ErrorKind::ServerError,
            RequestError::Client { .. } => ErrorKind::ClientError,
            RequestError::EmptyContent | RequestError::Other(_) => ErrorKind::Unknown,
        }
    }

    /// 凭据无效或无权限
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, RequestError::Client { status: 401 | 403, .. })
    }
}

/// 请求执行器的最终失败（不是异常，调用方据此回退）
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// 重试次数耗尽
    #[error("重试 {attempts} 次后仍然失败: {last}")]
    Exhausted { attempts: u32, last: RequestError },
}

/// 任务状态错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// 已有任务在运行
    #[error("任务正在运行中")]
    Busy,
    /// 轮数非法
    #[error("轮数必须大于 0")]
    InvalidRounds,
}

// ========== 便捷构造函数 ==========

impl FileError {
    /// 创建文件读取错误
    pub fn read_failed(path: &Path, source: std::io::Error) -> Self {
        FileError::ReadFailed {
            path: path.to_path_buf(),
            source,
        }
    }

    /// 创建文件写入错误
    pub fn write_failed(path: &Path, source: std::io::Error) -> Self {
        FileError::WriteFailed {
            path: path.to_path_buf(),
            source,
        }
    }

    /// 创建 JSON 错误
    pub fn json_failed(path: &Path, source: serde_json::Error) -> Self {
        FileError::JsonFailed {
            path: path.to_path_buf(),
            source,
        }
    }
}
