//! 收包模块的类型化配置。
//!
//! # 配置来源（Why）
//! - 模块运行期只读 [`SettingsStore`]：它既是配置快照，也是 `socket-timeout` 热更新的通知源；
//! - 宿主配置文件整体经 [`SettingsStore::from_toml_file`] 载入，`[pool]` 之类的分表被展平为
//!   `pool.max-packets` 形式的键，供缓冲池等其它组件读取；
//! - [`UdpSocketConfig::from_toml_str`] 只接受本模块的键，用于校验单独的模块配置片段；
//! - 两条路径最终都落到存储上，模块在 `init` 时统一经 [`UdpSocketConfig::from_settings`] 读取。
//!
//! # 键名（What）
//! | 键 | 默认值 | 说明 |
//! |---|---|---|
//! | `connection-PacketPoolModule` | `packetPool` | 缓冲池连接名 |
//! | `socket-port` | `0` | 监听端口，0 为系统分配 |
//! | `buffer-size` | `64` | 交接队列容量，必须为正 |
//! | `socket-timeout` | `5000` | 读超时毫秒数，0 为不设上限，可热更新 |
//! | `socket-recv-buffer` | 未设置 | 内核接收缓冲字节数 |
//! | `tick-group-name` | 模块名 | 调度组名 |
//! | `tick-idle-ms` | `1` | 调度组空转休眠毫秒数 |

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

use intake_core::{IntakeError, Result, SettingsStore, TickGroupOptions};

use crate::socket::BindOptions;

pub const KEY_POOL_CONNECTION: &str = "connection-PacketPoolModule";
pub const KEY_SOCKET_PORT: &str = "socket-port";
pub const KEY_BUFFER_SIZE: &str = "buffer-size";
pub const KEY_SOCKET_TIMEOUT: &str = "socket-timeout";
pub const KEY_SOCKET_RECV_BUFFER: &str = "socket-recv-buffer";
pub const KEY_TICK_GROUP_NAME: &str = "tick-group-name";
pub const KEY_TICK_IDLE_MS: &str = "tick-idle-ms";

pub const DEFAULT_POOL_CONNECTION: &str = "packetPool";
pub const DEFAULT_BUFFER_SIZE: usize = 64;
pub const DEFAULT_SOCKET_TIMEOUT_MS: i64 = 5000;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct UdpSocketConfig {
    #[serde(rename = "connection-PacketPoolModule")]
    pub pool_connection: String,
    pub socket_port: u16,
    pub buffer_size: usize,
    pub socket_timeout: u64,
    pub socket_recv_buffer: Option<usize>,
    pub tick_group_name: Option<String>,
    pub tick_idle_ms: u64,
}

impl Default for UdpSocketConfig {
    fn default() -> Self {
        Self {
            pool_connection: DEFAULT_POOL_CONNECTION.into(),
            socket_port: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT_MS as u64,
            socket_recv_buffer: None,
            tick_group_name: None,
            tick_idle_ms: 1,
        }
    }
}

impl UdpSocketConfig {
    /// 从配置存储读取，缺省键使用默认值。
    pub fn from_settings(settings: &SettingsStore) -> Result<Self> {
        let defaults = Self::default();
        let socket_recv_buffer = match settings.get(KEY_SOCKET_RECV_BUFFER) {
            Some(_) => Some(settings.get_parsed_or(KEY_SOCKET_RECV_BUFFER, 0usize)?),
            None => None,
        };
        let config = Self {
            pool_connection: settings.get_or_default(KEY_POOL_CONNECTION, DEFAULT_POOL_CONNECTION),
            socket_port: settings.get_parsed_or(KEY_SOCKET_PORT, defaults.socket_port)?,
            buffer_size: settings.get_parsed_or(KEY_BUFFER_SIZE, defaults.buffer_size)?,
            socket_timeout: settings.get_parsed_or(KEY_SOCKET_TIMEOUT, defaults.socket_timeout)?,
            socket_recv_buffer,
            tick_group_name: settings.get(KEY_TICK_GROUP_NAME),
            tick_idle_ms: settings.get_parsed_or(KEY_TICK_IDLE_MS, defaults.tick_idle_ms)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|err| IntakeError::Config(format!("invalid udp socket config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|err| {
            IntakeError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// 把全部字段写入配置存储。
    pub fn store_into(&self, settings: &SettingsStore) -> Result<()> {
        settings.set(KEY_POOL_CONNECTION, self.pool_connection.clone())?;
        settings.set(KEY_SOCKET_PORT, self.socket_port.to_string())?;
        settings.set(KEY_BUFFER_SIZE, self.buffer_size.to_string())?;
        settings.set(KEY_SOCKET_TIMEOUT, self.socket_timeout.to_string())?;
        match self.socket_recv_buffer {
            Some(size) => settings.set(KEY_SOCKET_RECV_BUFFER, size.to_string())?,
            None => settings.remove(KEY_SOCKET_RECV_BUFFER)?,
        }
        if let Some(name) = &self.tick_group_name {
            settings.set(KEY_TICK_GROUP_NAME, name.clone())?;
        }
        settings.set(KEY_TICK_IDLE_MS, self.tick_idle_ms.to_string())?;
        Ok(())
    }

    pub fn bind_options(&self) -> BindOptions {
        BindOptions::new(self.socket_port).with_recv_buffer_size(self.socket_recv_buffer)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout)
    }

    /// 调度组参数；未配置组名时使用 `default_name`（通常是模块名）。
    pub fn tick_group_options(&self, default_name: &str) -> TickGroupOptions {
        let name = self
            .tick_group_name
            .clone()
            .unwrap_or_else(|| default_name.to_owned());
        TickGroupOptions::new(name).with_idle(Duration::from_millis(self.tick_idle_ms))
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(IntakeError::invalid_setting(
                KEY_BUFFER_SIZE,
                "0",
                "handoff queue needs room for at least one packet",
            ));
        }
        if self.pool_connection.is_empty() {
            return Err(IntakeError::invalid_setting(
                KEY_POOL_CONNECTION,
                "",
                "pool connection name must not be empty",
            ));
        }
        if self.socket_recv_buffer == Some(0) {
            return Err(IntakeError::invalid_setting(
                KEY_SOCKET_RECV_BUFFER,
                "0",
                "receive buffer size must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_store() {
        let config = UdpSocketConfig::from_settings(&SettingsStore::new()).expect("默认配置");
        assert_eq!(config, UdpSocketConfig::default());
        assert_eq!(config.socket_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn toml_round_trips_through_store() {
        let config = UdpSocketConfig::from_toml_str(
            r#"
            connection-PacketPoolModule = "rtpPool"
            socket-port = 5060
            buffer-size = 2
            socket-timeout = 100
            socket-recv-buffer = 262144
            "#,
        )
        .expect("解析 TOML");
        let settings = SettingsStore::new();
        config.store_into(&settings).expect("写入存储");
        assert_eq!(UdpSocketConfig::from_settings(&settings).expect("读回"), config);
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        let settings = SettingsStore::new();
        settings.set(KEY_BUFFER_SIZE, "0").expect("写入配置");
        assert!(matches!(
            UdpSocketConfig::from_settings(&settings),
            Err(IntakeError::InvalidSetting { .. })
        ));
    }

    #[test]
    fn unknown_toml_keys_are_rejected() {
        assert!(matches!(
            UdpSocketConfig::from_toml_str("socket-prot = 1"),
            Err(IntakeError::Config(_))
        ));
    }

    #[test]
    fn tick_group_options_follow_config() {
        let settings = SettingsStore::new();
        let config = UdpSocketConfig::from_settings(&settings).expect("默认配置");
        let options = config.tick_group_options("udp-socket");
        assert_eq!(options.name, "udp-socket");
        assert_eq!(options.idle, Duration::from_millis(1));

        settings.set(KEY_TICK_GROUP_NAME, "rx-loop").expect("写入组名");
        settings.set(KEY_TICK_IDLE_MS, "5").expect("写入空转间隔");
        let options = UdpSocketConfig::from_settings(&settings)
            .expect("读取配置")
            .tick_group_options("udp-socket");
        assert_eq!(options.name, "rx-loop");
        assert_eq!(options.idle, Duration::from_millis(5));
    }

    #[test]
    fn pool_table_in_host_file_reaches_pool_config() {
        let settings = SettingsStore::from_toml_str(
            "socket-port = 0\nbuffer-size = 4\n[pool]\nmax-packets = 8\npacket-capacity = 512\n",
        )
        .expect("解析宿主配置");
        let pool = intake_buffer::PoolConfig::from_settings(&settings).expect("缓冲池配置");
        assert_eq!(pool.max_packets, 8);
        assert_eq!(pool.packet_capacity, 512);
        let config = UdpSocketConfig::from_settings(&settings).expect("模块配置忽略其它组件的键");
        assert_eq!(config.buffer_size, 4);
    }
}
