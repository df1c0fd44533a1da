//! 引擎配置。
//!
//! 会话复用开关只在启动时解析一次，并作为不可变配置注入 [`TlsEngine`](crate::TlsEngine)，
//! 不在运行期间读取全局可变状态。

use serde::Deserialize;

/// 关闭会话复用（上下文缓存）的环境变量。
pub const DISABLE_RESUME_ENV: &str = "SPARK_TLS_DISABLE_RESUME";

/// 每个连接入站缓冲的默认上限。
pub const DEFAULT_MAX_BUFFERED_INPUT: usize = 1 << 20;

/// OpenSSL 1.1.1 的版本号，自该版本起支持 TLS1.3。
const OPENSSL_TLS13_VERSION: i64 = 0x1010_100f;

/// TLS 引擎的运行配置。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// 为 `true` 时禁用按身份缓存的安全上下文，每个连接都构建新上下文。
    pub disable_tls_resume: bool,
    /// 覆盖平台的 TLS1.3 能力探测；`None` 表示按 OpenSSL 版本判断。
    pub tls13_supported: Option<bool>,
    /// 单个连接入站缓冲允许积压的最大字节数。
    pub max_buffered_input: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            disable_tls_resume: false,
            tls13_supported: None,
            max_buffered_input: DEFAULT_MAX_BUFFERED_INPUT,
        }
    }
}

impl EngineSettings {
    /// 读取环境变量得到配置，其余字段取默认值。
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(std::env::var(DISABLE_RESUME_ENV).ok().as_deref())
    }

    /// 显式设置优先于环境变量。
    pub fn with_disable_tls_resume(mut self, disable: bool) -> Self {
        self.disable_tls_resume = disable;
        self
    }

    pub fn with_tls13_supported(mut self, supported: bool) -> Self {
        self.tls13_supported = Some(supported);
        self
    }

    pub fn with_max_buffered_input(mut self, limit: usize) -> Self {
        self.max_buffered_input = limit;
        self
    }

    fn with_env_overrides(mut self, disable_resume: Option<&str>) -> Self {
        if let Some(value) = disable_resume {
            self.disable_tls_resume = parse_switch(value);
        }
        self
    }

    /// 平台是否可以协商 TLS1.3。
    pub fn tls13_supported(&self) -> bool {
        self.tls13_supported
            .unwrap_or_else(|| openssl::version::number() >= OPENSSL_TLS13_VERSION)
    }
}

fn parse_switch(value: &str) -> bool {
    let value = value.trim();
    value == "1" || value.eq_ignore_ascii_case("true")
}
