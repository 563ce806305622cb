//! 具名配置存储与整数监听器。
//!
//! # 模块定位（Why）
//! - 模块在 `init` 阶段按名称读取端口、队列容量等配置，并为可热更新的项（如接收超时）注册监听器；
//! - 配置变更需要同步地、每次变更至多一次地通知监听器，使新值立即作用于已打开的套接字。
//!
//! # 设计要点（How）
//! - 值快照使用 `ArcSwap<BTreeMap<..>>` 整表替换：读路径无锁，写路径串行化；
//! - 监听器注册表由 `parking_lot::Mutex` 保护；通知在释放注册表锁之后进行，监听器内部可安全读取存储；
//! - 每个注册记录最近一次成功应用的值，值未变化时不重复通知。
//!
//! # 契约（What）
//! - [`SettingsStore::set_listener`] 注册时立即以当前值（缺省则为默认值）触发一次；
//! - [`SettingsStore::set`] 在返回前完成全部通知；任一监听器拒绝新值时返回其错误，
//!   但存储中的值已更新，其余监听器照常收到通知；
//! - **前置条件**：监听器不得在回调中再次调用 `set`，否则会在写锁上自我阻塞。

use std::{
    collections::BTreeMap,
    fmt,
    path::Path,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::{IntakeError, Result};

/// 整数配置项的变更监听器。
///
/// 闭包 `Fn(&str, i64) -> Result<()>` 自动实现该 trait。
pub trait IntSettingListener: Send + Sync + 'static {
    /// 应用新值。返回错误表示拒绝该值。
    fn apply(&self, key: &str, value: i64) -> Result<()>;
}

impl<F> IntSettingListener for F
where
    F: Fn(&str, i64) -> Result<()> + Send + Sync + 'static,
{
    fn apply(&self, key: &str, value: i64) -> Result<()> {
        self(key, value)
    }
}

/// 监听器注册句柄，用于注销。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    key: String,
    default: i64,
    last_applied: i64,
    listener: Arc<dyn IntSettingListener>,
}

struct StoreInner {
    values: ArcSwap<BTreeMap<String, String>>,
    listeners: Mutex<Vec<Registration>>,
    write_lock: Mutex<()>,
    next_id: AtomicU64,
}

/// 内存配置存储，可克隆共享。
#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<StoreInner>,
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::from_map(BTreeMap::new())
    }
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以初始键值构造存储。
    pub fn from_map(values: BTreeMap<String, String>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                values: ArcSwap::from_pointee(values),
                listeners: Mutex::new(Vec::new()),
                write_lock: Mutex::new(()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// 从扁平（或嵌套，按 `.` 展开）的 TOML 表构造存储。
    ///
    /// 标量统一转为字符串保存；数组不受支持，返回 [`IntakeError::Config`]。
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let table: toml::Table = source
            .parse()
            .map_err(|err: toml::de::Error| IntakeError::Config(err.to_string()))?;
        let mut values = BTreeMap::new();
        flatten_table(None, &table, &mut values)?;
        Ok(Self::from_map(values))
    }

    /// 读取 TOML 文件构造存储。
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|err| IntakeError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// 读取原始字符串值。
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.values.load().get(key).cloned()
    }

    pub fn get_or_default(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_owned())
    }

    /// 读取并解析配置值，缺省时返回 `default`。
    pub fn get_parsed_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(raw) => parse_value(key, &raw),
            None => Ok(default),
        }
    }

    pub fn get_int_or_default(&self, key: &str, default: i64) -> Result<i64> {
        self.get_parsed_or(key, default)
    }

    /// 当前全部键值的快照。
    pub fn snapshot(&self) -> Arc<BTreeMap<String, String>> {
        self.inner.values.load_full()
    }

    /// 写入配置值并同步通知该键的监听器。
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        let _guard = self.inner.write_lock.lock();
        self.inner.values.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.insert(key.clone(), value.clone());
            next
        });
        tracing::debug!(setting = %key, value = %value, "setting changed");
        self.notify(&key, Some(&value))
    }

    /// 移除配置值；监听器回退到各自的默认值。
    pub fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.inner.write_lock.lock();
        self.inner.values.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.remove(key);
            next
        });
        self.notify(key, None)
    }

    /// 注册整数监听器，并立即以当前值（或 `default`）触发一次。
    ///
    /// 首次应用失败时不会注册，直接返回错误。
    pub fn set_listener(
        &self,
        key: impl Into<String>,
        listener: Arc<dyn IntSettingListener>,
        default: i64,
    ) -> Result<ListenerId> {
        let key = key.into();
        let _guard = self.inner.write_lock.lock();
        let current = match self.get(&key) {
            Some(raw) => parse_value(&key, &raw)?,
            None => default,
        };
        listener.apply(&key, current)?;

        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push(Registration {
            id,
            key,
            default,
            last_applied: current,
            listener,
        });
        Ok(id)
    }

    /// 注销监听器；返回是否确实移除了一条注册。
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        listeners.len() != before
    }

    /// 当前注册的监听器数量。
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    fn notify(&self, key: &str, raw: Option<&str>) -> Result<()> {
        let parsed = raw.map(|raw| parse_value::<i64>(key, raw)).transpose();
        let pending: Vec<(ListenerId, i64, Arc<dyn IntSettingListener>)> = {
            let listeners = self.inner.listeners.lock();
            let mut pending = Vec::new();
            for registration in listeners.iter().filter(|r| r.key == key) {
                let value = match &parsed {
                    Ok(Some(value)) => *value,
                    Ok(None) => registration.default,
                    Err(_) => continue,
                };
                if value != registration.last_applied {
                    pending.push((registration.id, value, Arc::clone(&registration.listener)));
                }
            }
            pending
        };

        // 值非法时，已注册监听器的键必须报错，未注册的键则只是普通字符串配置。
        if let Err(err) = parsed {
            let watched = self.inner.listeners.lock().iter().any(|r| r.key == key);
            return if watched { Err(err) } else { Ok(()) };
        }

        let mut first_error = None;
        for (id, value, listener) in pending {
            match listener.apply(key, value) {
                Ok(()) => {
                    if let Some(registration) = self
                        .inner
                        .listeners
                        .lock()
                        .iter_mut()
                        .find(|registration| registration.id == id)
                    {
                        registration.last_applied = value;
                    }
                }
                Err(err) => {
                    tracing::warn!(setting = %key, value, error = %err, "setting listener rejected value");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsStore")
            .field("values", &self.inner.values.load())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|err| IntakeError::invalid_setting(key, raw, err.to_string()))
}

fn flatten_table(
    prefix: Option<&str>,
    table: &toml::Table,
    out: &mut BTreeMap<String, String>,
) -> Result<()> {
    for (name, value) in table {
        let key = match prefix {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.clone(),
        };
        match value {
            toml::Value::String(text) => {
                out.insert(key, text.clone());
            }
            toml::Value::Integer(number) => {
                out.insert(key, number.to_string());
            }
            toml::Value::Float(number) => {
                out.insert(key, number.to_string());
            }
            toml::Value::Boolean(flag) => {
                out.insert(key, flag.to_string());
            }
            toml::Value::Datetime(stamp) => {
                out.insert(key, stamp.to_string());
            }
            toml::Value::Table(nested) => flatten_table(Some(&key), nested, out)?,
            toml::Value::Array(_) => {
                return Err(IntakeError::Config(format!(
                    "setting `{key}` is an array; only scalar values are supported"
                )));
            }
        }
    }
    Ok(())
}
