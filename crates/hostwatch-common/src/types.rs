use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitored machine, created on first contact and refreshed on every
/// heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub uuid: String,
    pub system: String,
    pub os_version: String,
    pub hostname: String,
    /// Seconds since boot, as last reported by the host.
    pub uptime: i64,
    /// Seconds between two agent reports, when the agent advertises it.
    pub sync_interval: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Incident severity, ordered from lowest to highest.
///
/// The ordinal is what gets persisted in the `incidents.severity` column.
///
/// # Examples
///
/// ```
/// use hostwatch_common::types::Severity;
///
/// let sev: Severity = "warning".parse().unwrap();
/// assert_eq!(sev, Severity::Warning);
/// assert_eq!(sev.to_string(), "warning");
/// assert_eq!(Severity::from_ordinal(sev.ordinal()), Some(sev));
/// assert!(Severity::Critical > Severity::Warning);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn ordinal(self) -> i32 {
        match self {
            Severity::Warning => 1,
            Severity::Critical => 2,
        }
    }

    pub fn from_ordinal(value: i32) -> Option<Self> {
        match value {
            1 => Some(Severity::Warning),
            2 => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "warning" | "warn" => Ok(Severity::Warning),
            "critical" | "crit" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

/// Which table of the sample store a metric row comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    CpuTimes,
    CpuStats,
    Memory,
    Swap,
    LoadAvg,
    Disk,
    IoNet,
    IoBlock,
}

impl SampleKind {
    pub const ALL: [SampleKind; 8] = [
        SampleKind::CpuTimes,
        SampleKind::CpuStats,
        SampleKind::Memory,
        SampleKind::Swap,
        SampleKind::LoadAvg,
        SampleKind::Disk,
        SampleKind::IoNet,
        SampleKind::IoBlock,
    ];

    /// Canonical table name, as stored in `alerts.table`.
    pub fn table(self) -> &'static str {
        match self {
            SampleKind::CpuTimes => "cputimes",
            SampleKind::CpuStats => "cpustats",
            SampleKind::Memory => "memory",
            SampleKind::Swap => "swap",
            SampleKind::LoadAvg => "loadavg",
            SampleKind::Disk => "disks",
            SampleKind::IoNet => "ionets",
            SampleKind::IoBlock => "ioblocks",
        }
    }

    /// Resolves a table name, accepting the snake_case aliases used by
    /// older rule documents (`cpu_times`, `io_net`, ...).
    ///
    /// # Examples
    ///
    /// ```
    /// use hostwatch_common::types::SampleKind;
    ///
    /// assert_eq!(SampleKind::from_table("cpu_times"), Some(SampleKind::CpuTimes));
    /// assert_eq!(SampleKind::from_table("disks"), Some(SampleKind::Disk));
    /// assert_eq!(SampleKind::from_table("users"), None);
    /// ```
    pub fn from_table(table: &str) -> Option<Self> {
        match table.trim().to_lowercase().as_str() {
            "cputimes" | "cpu_times" => Some(SampleKind::CpuTimes),
            "cpustats" | "cpu_stats" => Some(SampleKind::CpuStats),
            "memory" => Some(SampleKind::Memory),
            "swap" => Some(SampleKind::Swap),
            "loadavg" | "load_avg" => Some(SampleKind::LoadAvg),
            "disks" | "disk" => Some(SampleKind::Disk),
            "ionets" | "ionet" | "io_net" => Some(SampleKind::IoNet),
            "ioblocks" | "ioblock" | "io_block" => Some(SampleKind::IoBlock),
            _ => None,
        }
    }

    /// Fields holding a numeric gauge or counter.
    pub fn numeric_fields(self) -> &'static [&'static str] {
        match self {
            SampleKind::CpuTimes => &[
                "cuser",
                "nice",
                "system",
                "idle",
                "iowait",
                "irq",
                "softirq",
                "steal",
                "guest",
                "guest_nice",
            ],
            SampleKind::CpuStats => &[
                "interrupts",
                "ctx_switches",
                "soft_interrupts",
                "processes",
                "procs_running",
                "procs_blocked",
            ],
            SampleKind::Memory => &["total", "free", "used", "shared", "buffers", "cached"],
            SampleKind::Swap => &["total", "free", "used"],
            SampleKind::LoadAvg => &["one", "five", "fifteen"],
            SampleKind::Disk => &["total_space", "avail_space"],
            SampleKind::IoNet => &[
                "rx_bytes",
                "rx_packets",
                "rx_errs",
                "rx_drop",
                "tx_bytes",
                "tx_packets",
                "tx_errs",
                "tx_drop",
            ],
            SampleKind::IoBlock => &[
                "read_count",
                "read_bytes",
                "write_count",
                "write_bytes",
                "busy_time",
            ],
        }
    }

    /// Fields holding a label (device, mount point, interface name).
    pub fn text_fields(self) -> &'static [&'static str] {
        match self {
            SampleKind::Disk => &["disk_name", "mount_point"],
            SampleKind::IoNet => &["interface"],
            SampleKind::IoBlock => &["device_name"],
            _ => &[],
        }
    }

    pub fn has_field(self, name: &str) -> bool {
        self.numeric_fields().contains(&name) || self.text_fields().contains(&name)
    }
}

impl std::fmt::Display for SampleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

impl std::str::FromStr for SampleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SampleKind::from_table(s).ok_or_else(|| format!("unknown sample table: {s}"))
    }
}

/// A field read out of a sample row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Number(f64),
    Text(&'a str),
}

impl FieldValue<'_> {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuTimes {
    pub cuser: i64,
    pub nice: i64,
    pub system: i64,
    pub idle: i64,
    pub iowait: i64,
    pub irq: i64,
    pub softirq: i64,
    pub steal: i64,
    pub guest: i64,
    pub guest_nice: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub interrupts: i64,
    pub ctx_switches: i64,
    pub soft_interrupts: i64,
    pub processes: i64,
    pub procs_running: i64,
    pub procs_blocked: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub total: i64,
    pub free: i64,
    pub used: i64,
    pub shared: i64,
    pub buffers: i64,
    pub cached: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Swap {
    pub total: i64,
    pub free: i64,
    pub used: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadAvg {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disk {
    pub disk_name: String,
    pub mount_point: String,
    pub total_space: i64,
    pub avail_space: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoNet {
    pub interface: String,
    pub rx_bytes: i64,
    pub rx_packets: i64,
    pub rx_errs: i64,
    pub rx_drop: i64,
    pub tx_bytes: i64,
    pub tx_packets: i64,
    pub tx_errs: i64,
    pub tx_drop: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoBlock {
    pub device_name: String,
    pub read_count: i64,
    pub read_bytes: i64,
    pub write_count: i64,
    pub write_bytes: i64,
    pub busy_time: i64,
}

/// Payload of one sample row. Serialized with a `kind` tag so a row can be
/// stored as a single JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SampleData {
    CpuTimes(CpuTimes),
    CpuStats(CpuStats),
    Memory(Memory),
    Swap(Swap),
    LoadAvg(LoadAvg),
    Disk(Disk),
    IoNet(IoNet),
    IoBlock(IoBlock),
}

impl SampleData {
    pub fn kind(&self) -> SampleKind {
        match self {
            SampleData::CpuTimes(_) => SampleKind::CpuTimes,
            SampleData::CpuStats(_) => SampleKind::CpuStats,
            SampleData::Memory(_) => SampleKind::Memory,
            SampleData::Swap(_) => SampleKind::Swap,
            SampleData::LoadAvg(_) => SampleKind::LoadAvg,
            SampleData::Disk(_) => SampleKind::Disk,
            SampleData::IoNet(_) => SampleKind::IoNet,
            SampleData::IoBlock(_) => SampleKind::IoBlock,
        }
    }

    /// Reads a field by its column name.
    pub fn field(&self, name: &str) -> Option<FieldValue<'_>> {
        use FieldValue::{Number, Text};
        let n = |v: i64| Some(Number(v as f64));
        match self {
            SampleData::CpuTimes(c) => match name {
                "cuser" => n(c.cuser),
                "nice" => n(c.nice),
                "system" => n(c.system),
                "idle" => n(c.idle),
                "iowait" => n(c.iowait),
                "irq" => n(c.irq),
                "softirq" => n(c.softirq),
                "steal" => n(c.steal),
                "guest" => n(c.guest),
                "guest_nice" => n(c.guest_nice),
                _ => None,
            },
            SampleData::CpuStats(c) => match name {
                "interrupts" => n(c.interrupts),
                "ctx_switches" => n(c.ctx_switches),
                "soft_interrupts" => n(c.soft_interrupts),
                "processes" => n(c.processes),
                "procs_running" => n(c.procs_running),
                "procs_blocked" => n(c.procs_blocked),
                _ => None,
            },
            SampleData::Memory(m) => match name {
                "total" => n(m.total),
                "free" => n(m.free),
                "used" => n(m.used),
                "shared" => n(m.shared),
                "buffers" => n(m.buffers),
                "cached" => n(m.cached),
                _ => None,
            },
            SampleData::Swap(s) => match name {
                "total" => n(s.total),
                "free" => n(s.free),
                "used" => n(s.used),
                _ => None,
            },
            SampleData::LoadAvg(l) => match name {
                "one" => Some(Number(l.one)),
                "five" => Some(Number(l.five)),
                "fifteen" => Some(Number(l.fifteen)),
                _ => None,
            },
            SampleData::Disk(d) => match name {
                "disk_name" => Some(Text(&d.disk_name)),
                "mount_point" => Some(Text(&d.mount_point)),
                "total_space" => n(d.total_space),
                "avail_space" => n(d.avail_space),
                _ => None,
            },
            SampleData::IoNet(i) => match name {
                "interface" => Some(Text(&i.interface)),
                "rx_bytes" => n(i.rx_bytes),
                "rx_packets" => n(i.rx_packets),
                "rx_errs" => n(i.rx_errs),
                "rx_drop" => n(i.rx_drop),
                "tx_bytes" => n(i.tx_bytes),
                "tx_packets" => n(i.tx_packets),
                "tx_errs" => n(i.tx_errs),
                "tx_drop" => n(i.tx_drop),
                _ => None,
            },
            SampleData::IoBlock(b) => match name {
                "device_name" => Some(Text(&b.device_name)),
                "read_count" => n(b.read_count),
                "read_bytes" => n(b.read_bytes),
                "write_count" => n(b.write_count),
                "write_bytes" => n(b.write_bytes),
                "busy_time" => n(b.busy_time),
                _ => None,
            },
        }
    }
}

/// One immutable measurement row, scoped to a host and a capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub host_uuid: String,
    pub created_at: DateTime<Utc>,
    pub data: SampleData,
}

impl MetricSample {
    pub fn new(host_uuid: impl Into<String>, created_at: DateTime<Utc>, data: SampleData) -> Self {
        Self {
            host_uuid: host_uuid.into(),
            created_at,
            data,
        }
    }

    pub fn kind(&self) -> SampleKind {
        self.data.kind()
    }

    pub fn field(&self, name: &str) -> Option<FieldValue<'_>> {
        self.data.field(name)
    }
}
