//! Raw device bridge.
//!
//! Maps a guest address range onto a peripheral implemented outside the
//! emulator, in a shared object exporting three C entry points:
//!
//! ```c
//! int      plugin_init(const char *args);                            // 0 = ok
//! uint64_t plugin_read(uint64_t offset, uint32_t size);
//! void     plugin_write(uint64_t offset, uint64_t value, uint32_t size);
//! ```
//!
//! The bridge only binds and forwards: every load and store in the range
//! goes straight to the plugin, with the offset from the region base and
//! the access size in bytes.

use crate::bus::{BusError, MmioDevice, SystemBus};
use crate::dram::MemoryError;
use serde::{Deserialize, Serialize};
use std::ffi::{CStr, CString, c_char, c_int};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub const PLUGIN_INIT_SYMBOL: &str = "plugin_init";
pub const PLUGIN_READ_SYMBOL: &str = "plugin_read";
pub const PLUGIN_WRITE_SYMBOL: &str = "plugin_write";

pub type PluginInitFn = unsafe extern "C" fn(*const c_char) -> c_int;
pub type PluginReadFn = unsafe extern "C" fn(u64, u32) -> u64;
pub type PluginWriteFn = unsafe extern "C" fn(u64, u64, u32);

#[derive(Debug, Error)]
pub enum RawDeviceError {
    #[error("loading plugin '{}' failed: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    #[error("plugin '{}' does not export '{symbol}'", path.display())]
    MissingSymbol { path: PathBuf, symbol: &'static str },

    #[error("plugin '{}' init failed with status {status}", path.display())]
    InitFailed { path: PathBuf, status: i32 },

    #[error("plugin argument string contains a NUL byte")]
    InvalidArgument,

    #[error("invalid raw device option: {0}")]
    Config(String),

    #[error(transparent)]
    Map(#[from] BusError),
}

/// The three-function contract of a raw device implementation.
///
/// The bridge forwards each access on whatever thread issued it and adds
/// no locking of its own. Plugins are written for a single CPU thread, so
/// callers sharing the bus across threads must keep accesses to a raw
/// region on one thread.
pub trait RawPlugin: Send + Sync {
    fn init(&self, args: &CStr) -> i32;
    fn read(&self, offset: u64, size: u32) -> u64;
    fn write(&self, offset: u64, value: u64, size: u32);
}

/// Produces a [`RawPlugin`] from the configured backing file.
pub trait PluginLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn RawPlugin>, RawDeviceError>;
}

/// Loads plugins from shared objects with `dlopen`.
#[cfg(unix)]
pub struct DylibLoader;

#[cfg(unix)]
impl PluginLoader for DylibLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn RawPlugin>, RawDeviceError> {
        Ok(Box::new(SharedObjectPlugin::open(path)?))
    }
}

/// A plugin resolved from a shared object. The object is closed on drop.
#[cfg(unix)]
pub struct SharedObjectPlugin {
    path: PathBuf,
    handle: *mut libc::c_void,
    init: PluginInitFn,
    read: PluginReadFn,
    write: PluginWriteFn,
}

// SAFETY: the handle is only used for dlclose on drop, and the entry points
// are plain C functions. The plugin contract requires them to be callable
// from the emulator's CPU thread, which may differ from the loading thread.
#[cfg(unix)]
unsafe impl Send for SharedObjectPlugin {}
#[cfg(unix)]
unsafe impl Sync for SharedObjectPlugin {}

#[cfg(unix)]
fn last_dl_error() -> String {
    // SAFETY: dlerror returns either NULL or a valid C string owned by libc.
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

#[cfg(unix)]
impl SharedObjectPlugin {
    pub fn open(path: &Path) -> Result<Self, RawDeviceError> {
        use std::os::unix::ffi::OsStrExt;

        let c_path =
            CString::new(path.as_os_str().as_bytes()).map_err(|_| RawDeviceError::Load {
                path: path.to_path_buf(),
                reason: "path contains a NUL byte".to_string(),
            })?;

        // SAFETY: `c_path` is a valid NUL-terminated string.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(RawDeviceError::Load {
                path: path.to_path_buf(),
                reason: last_dl_error(),
            });
        }

        let resolve = |symbol: &'static str| -> Result<*mut libc::c_void, RawDeviceError> {
            let name = CString::new(symbol).map_err(|_| RawDeviceError::InvalidArgument)?;
            // SAFETY: `handle` came from a successful dlopen.
            let sym = unsafe { libc::dlsym(handle, name.as_ptr()) };
            if sym.is_null() {
                Err(RawDeviceError::MissingSymbol {
                    path: path.to_path_buf(),
                    symbol,
                })
            } else {
                Ok(sym)
            }
        };

        let symbols = (|| {
            Ok::<_, RawDeviceError>((
                resolve(PLUGIN_INIT_SYMBOL)?,
                resolve(PLUGIN_READ_SYMBOL)?,
                resolve(PLUGIN_WRITE_SYMBOL)?,
            ))
        })();
        let (init, read, write) = match symbols {
            Ok(symbols) => symbols,
            Err(e) => {
                // SAFETY: `handle` came from dlopen and is not used again.
                unsafe { libc::dlclose(handle) };
                return Err(e);
            }
        };

        log::debug!("[RawDevice] loaded '{}'", path.display());

        // SAFETY: the symbols are declared by the plugin ABI with exactly
        // these signatures.
        unsafe {
            Ok(Self {
                path: path.to_path_buf(),
                handle,
                init: std::mem::transmute::<*mut libc::c_void, PluginInitFn>(init),
                read: std::mem::transmute::<*mut libc::c_void, PluginReadFn>(read),
                write: std::mem::transmute::<*mut libc::c_void, PluginWriteFn>(write),
            })
        }
    }
}

#[cfg(unix)]
impl RawPlugin for SharedObjectPlugin {
    fn init(&self, args: &CStr) -> i32 {
        // SAFETY: plugin ABI; `args` outlives the call.
        unsafe { (self.init)(args.as_ptr()) }
    }

    fn read(&self, offset: u64, size: u32) -> u64 {
        // SAFETY: plugin ABI.
        unsafe { (self.read)(offset, size) }
    }

    fn write(&self, offset: u64, value: u64, size: u32) {
        // SAFETY: plugin ABI.
        unsafe { (self.write)(offset, value, size) }
    }
}

#[cfg(unix)]
impl Drop for SharedObjectPlugin {
    fn drop(&mut self) {
        log::debug!("[RawDevice] unloading '{}'", self.path.display());
        // SAFETY: the handle came from dlopen and the entry points die with
        // `self`, so nothing can call into the object afterwards.
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

/// Placement and backing of one raw device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDeviceConfig {
    pub addr: u64,
    pub size: u64,
    pub file: PathBuf,
    #[serde(default)]
    pub arg: String,
}

/// Format like C's `%#lX`: `0X` prefix and upper-case digits, plain `0`
/// for zero.
fn c_alt_hex(value: u64) -> String {
    if value == 0 {
        "0".to_string()
    } else {
        format!("0X{:X}", value)
    }
}

fn parse_u64(value: &str) -> Result<u64, RawDeviceError> {
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => value.replace('_', "").parse(),
    };
    parsed.map_err(|_| RawDeviceError::Config(format!("invalid number '{}'", value)))
}

impl RawDeviceConfig {
    /// File name of the backing object, used as `argv[0]` for the plugin.
    pub fn basename(&self) -> String {
        match self.file.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => self.file.to_string_lossy().into_owned(),
        }
    }

    /// The single argument string handed to `plugin_init`.
    pub fn init_args(&self) -> String {
        let mut args = format!(
            "{} --addr {} --size {}",
            self.basename(),
            c_alt_hex(self.addr),
            c_alt_hex(self.size)
        );
        if !self.arg.is_empty() {
            args.push(' ');
            args.push_str(&self.arg);
        }
        args
    }
}

/// Parses `[raw,]addr=<n>,size=<n>,file=<path>[,arg=<text>]`.
///
/// Numbers are decimal or `0x` hex. `arg` takes the rest of the string,
/// commas included, so it must come last.
impl FromStr for RawDeviceConfig {
    type Err = RawDeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rest = s.strip_prefix("raw,").unwrap_or(s);
        let mut addr = None;
        let mut size = None;
        let mut file = None;
        let mut arg = String::new();

        while !rest.is_empty() {
            if let Some(value) = rest.strip_prefix("arg=") {
                arg = value.to_string();
                break;
            }
            let (item, tail) = rest.split_once(',').unwrap_or((rest, ""));
            rest = tail;
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| RawDeviceError::Config(format!("expected key=value, got '{}'", item)))?;
            match key {
                "addr" => addr = Some(parse_u64(value)?),
                "size" => size = Some(parse_u64(value)?),
                "file" => file = Some(PathBuf::from(value)),
                _ => return Err(RawDeviceError::Config(format!("unknown key '{}'", key))),
            }
        }

        Ok(Self {
            addr: addr.ok_or_else(|| RawDeviceError::Config("missing 'addr'".to_string()))?,
            size: size.ok_or_else(|| RawDeviceError::Config("missing 'size'".to_string()))?,
            file: file.ok_or_else(|| RawDeviceError::Config("missing 'file'".to_string()))?,
            arg,
        })
    }
}

impl fmt::Display for RawDeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "raw,addr={:#x},size={:#x},file={}",
            self.addr,
            self.size,
            self.file.display()
        )?;
        if !self.arg.is_empty() {
            write!(f, ",arg={}", self.arg)?;
        }
        Ok(())
    }
}

/// A realized raw device: a plugin bound to a mapped address range.
pub struct RawDevice {
    config: RawDeviceConfig,
    plugin: Box<dyn RawPlugin>,
}

impl RawDevice {
    /// Load, initialize and map a raw device.
    ///
    /// The region is only mapped after `plugin_init` has returned 0. On any
    /// error nothing is mapped and the plugin, if loaded, is released.
    pub fn realize(
        config: RawDeviceConfig,
        loader: &dyn PluginLoader,
        bus: &SystemBus,
    ) -> Result<Arc<Self>, RawDeviceError> {
        log::info!(
            "[RawDevice] file {}, addr {:#x}, size {}",
            config.file.display(),
            config.addr,
            config.size
        );
        let region_name = format!("raw:{}", config.basename());
        bus.check_free(&region_name, config.addr, config.size)?;

        let plugin = loader.load(&config.file)?;

        let args = config.init_args();
        log::info!("[RawDevice] init: {}", args);
        let c_args = CString::new(args).map_err(|_| RawDeviceError::InvalidArgument)?;
        let status = plugin.init(&c_args);
        if status != 0 {
            return Err(RawDeviceError::InitFailed {
                path: config.file.clone(),
                status,
            });
        }

        let device = Arc::new(Self { config, plugin });
        bus.map(
            region_name,
            device.config.addr,
            device.config.size,
            device.clone(),
        )?;
        Ok(device)
    }

    /// Remove the device's region from `bus`. The plugin is released once
    /// the last reference to the device goes away.
    pub fn unrealize(&self, bus: &SystemBus) {
        if bus.unmap(self.config.addr).is_some() {
            log::info!("[RawDevice] unmapped {}", self.config);
        }
    }

    pub fn config(&self) -> &RawDeviceConfig {
        &self.config
    }
}

impl MmioDevice for RawDevice {
    fn load(&self, offset: u64, size: u64) -> Result<u64, MemoryError> {
        Ok(self.plugin.read(offset, size as u32))
    }

    fn store(&self, offset: u64, size: u64, value: u64) -> Result<(), MemoryError> {
        self.plugin.write(offset, value, size as u32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Trap;
    use crate::bus::Bus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Record {
        init_args: Mutex<Vec<String>>,
        writes: Mutex<Vec<(u64, u64, u32)>>,
        reads: Mutex<Vec<(u64, u32)>>,
    }

    /// Reads return `offset * 2`; writes are recorded.
    struct FakePlugin {
        record: Arc<Record>,
        init_status: i32,
    }

    impl RawPlugin for FakePlugin {
        fn init(&self, args: &CStr) -> i32 {
            self.record
                .init_args
                .lock()
                .unwrap()
                .push(args.to_string_lossy().into_owned());
            self.init_status
        }

        fn read(&self, offset: u64, size: u32) -> u64 {
            self.record.reads.lock().unwrap().push((offset, size));
            offset * 2
        }

        fn write(&self, offset: u64, value: u64, size: u32) {
            self.record.writes.lock().unwrap().push((offset, value, size));
        }
    }

    struct FakeLoader {
        record: Arc<Record>,
        init_status: i32,
        loads: Mutex<Vec<PathBuf>>,
    }

    impl FakeLoader {
        fn new(init_status: i32) -> Self {
            Self {
                record: Arc::new(Record::default()),
                init_status,
                loads: Mutex::new(Vec::new()),
            }
        }
    }

    impl PluginLoader for FakeLoader {
        fn load(&self, path: &Path) -> Result<Box<dyn RawPlugin>, RawDeviceError> {
            self.loads.lock().unwrap().push(path.to_path_buf());
            Ok(Box::new(FakePlugin {
                record: Arc::clone(&self.record),
                init_status: self.init_status,
            }))
        }
    }

    fn config() -> RawDeviceConfig {
        RawDeviceConfig {
            addr: 0xFF10_0000,
            size: 0x1000,
            file: PathBuf::from("/opt/plugins/libgpio.so"),
            arg: "--pins 8".to_string(),
        }
    }

    #[test]
    fn test_init_args_format() {
        assert_eq!(
            config().init_args(),
            "libgpio.so --addr 0XFF100000 --size 0X1000 --pins 8"
        );

        let mut bare = config();
        bare.arg.clear();
        bare.addr = 0;
        assert_eq!(bare.init_args(), "libgpio.so --addr 0 --size 0X1000");
    }

    #[test]
    fn test_forwarding() {
        let bus = SystemBus::new(0, 0x1000);
        let loader = FakeLoader::new(0);
        let base = config().addr;
        RawDevice::realize(config(), &loader, &bus).unwrap();

        assert_eq!(bus.read32(base + 0x10).unwrap(), 0x20);
        bus.write32(base + 0x4, 7).unwrap();
        bus.write8(base + 0x8, 0xAB).unwrap();

        assert_eq!(*loader.record.reads.lock().unwrap(), vec![(0x10, 4)]);
        assert_eq!(
            *loader.record.writes.lock().unwrap(),
            vec![(0x4, 7, 4), (0x8, 0xAB, 1)]
        );
        assert_eq!(
            *loader.record.init_args.lock().unwrap(),
            vec!["libgpio.so --addr 0XFF100000 --size 0X1000 --pins 8".to_string()]
        );
        assert_eq!(
            *loader.loads.lock().unwrap(),
            vec![PathBuf::from("/opt/plugins/libgpio.so")]
        );
    }

    #[test]
    fn test_access_forwarded_on_issuing_thread() {
        let bus = Arc::new(SystemBus::new(0, 0x1000));
        let loader = FakeLoader::new(0);
        let base = config().addr;
        RawDevice::realize(config(), &loader, &bus).unwrap();

        let worker = {
            let bus = Arc::clone(&bus);
            std::thread::spawn(move || bus.write16(base + 0x2, 0x55).unwrap())
        };
        worker.join().unwrap();
        assert_eq!(*loader.record.writes.lock().unwrap(), vec![(0x2, 0x55, 2)]);
    }

    #[test]
    fn test_init_failure_leaves_region_unmapped() {
        let bus = SystemBus::new(0, 0x1000);
        let loader = FakeLoader::new(-1);
        let base = config().addr;

        let err = RawDevice::realize(config(), &loader, &bus).err().unwrap();
        assert!(matches!(err, RawDeviceError::InitFailed { status: -1, .. }));
        assert!(!bus.is_mapped(base));
        assert_eq!(bus.read32(base), Err(Trap::LoadAccessFault(base)));
        assert_eq!(bus.write32(base, 1), Err(Trap::StoreAccessFault(base)));
        assert!(loader.record.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_overlap_rejected_before_init() {
        let bus = SystemBus::new(0, 0x1000);
        let loader = FakeLoader::new(0);
        let mut cfg = config();
        cfg.addr = 0x800;

        let err = RawDevice::realize(cfg, &loader, &bus).err().unwrap();
        assert!(matches!(err, RawDeviceError::Map(BusError::Overlap { .. })));
        assert!(loader.loads.lock().unwrap().is_empty());
        assert!(loader.record.init_args.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unrealize_unmaps() {
        let bus = SystemBus::new(0, 0);
        let loader = FakeLoader::new(0);
        let device = RawDevice::realize(config(), &loader, &bus).unwrap();
        assert!(bus.is_mapped(0xFF10_0FFF));

        device.unrealize(&bus);
        assert!(!bus.is_mapped(0xFF10_0000));
        assert_eq!(Arc::strong_count(&device), 1);
    }

    #[test]
    fn test_config_parse() {
        let cfg: RawDeviceConfig = "raw,addr=0xFF100000,size=4096,file=/tmp/dev.so,arg=-v,--mode=fast"
            .parse()
            .unwrap();
        assert_eq!(cfg.addr, 0xFF10_0000);
        assert_eq!(cfg.size, 4096);
        assert_eq!(cfg.file, PathBuf::from("/tmp/dev.so"));
        assert_eq!(cfg.arg, "-v,--mode=fast");

        let cfg: RawDeviceConfig = "file=a.so,size=0x10,addr=0x2000_0000".parse().unwrap();
        assert_eq!(cfg.addr, 0x2000_0000);
        assert_eq!(cfg.arg, "");
        assert_eq!(cfg.to_string(), "raw,addr=0x20000000,size=0x10,file=a.so");
    }

    #[test]
    fn test_config_parse_errors() {
        assert!(matches!(
            "addr=1,size=2".parse::<RawDeviceConfig>(),
            Err(RawDeviceError::Config(_))
        ));
        assert!(matches!(
            "addr=zz,size=2,file=x".parse::<RawDeviceConfig>(),
            Err(RawDeviceError::Config(_))
        ));
        assert!(matches!(
            "addr=1,size=2,file=x,colour=red".parse::<RawDeviceConfig>(),
            Err(RawDeviceError::Config(_))
        ));
        assert!(matches!(
            "addr".parse::<RawDeviceConfig>(),
            Err(RawDeviceError::Config(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_dylib_loader_missing_file() {
        let err = DylibLoader
            .load(Path::new("/nonexistent/libnothing.so"))
            .err()
            .unwrap();
        assert!(matches!(err, RawDeviceError::Load { .. }));
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_dylib_loader_missing_symbols() {
        let err = DylibLoader.load(Path::new("libc.so.6")).err().unwrap();
        assert!(matches!(
            err,
            RawDeviceError::MissingSymbol {
                symbol: PLUGIN_INIT_SYMBOL,
                ..
            }
        ));
    }
}
