/*!
Captured outputs from a UNAS Pro

Raw text exactly as the kernel / tools print it, so parsers are tested against real shapes.
*/

use unas_core::{CurveParam, FanCurveConfig, Topics};

/// `/proc/stat` head line before the 100 ms window. Idle+iowait = 800, total = 1000.
pub const PROC_STAT_BEFORE: &str = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\n";
/// After the window: +50 busy, +150 idle+iowait ⇒ 25 % usage.
pub const PROC_STAT_AFTER: &str = "cpu  140 0 110 840 110 0 0 0 0 0\ncpu0 70 0 55 420 55 0 0 0 0 0\n";

/// `/proc/diskstats` with two whole disks, a partition, an md array and a loop device.
pub const DISKSTATS_BEFORE: &str = "\
   7       0 loop0 10 0 20 0 0 0 0 0 0 0 0 0 0 0 0 0 0
   8       0 sda 1000 0 2048 100 500 0 4096 50 0 150 150 0 0 0 0 0 0
   8       1 sda1 900 0 1024 90 400 0 2048 40 0 130 130 0 0 0 0 0 0
   8      16 sdb 2000 0 4096 200 800 0 8192 80 0 280 280 0 0 0 0 0 0
   9       0 md3 100 0 999999 0 100 0 999999 0 0 0 0 0 0 0 0 0 0
";

/// One second later: sda read +2048 sectors, sdb read +2048 and wrote +4096 sectors.
/// Reads: 4096 sectors * 512 B = 2 MiB; writes: 4096 * 512 = 2 MiB.
pub const DISKSTATS_AFTER: &str = "\
   7       0 loop0 10 0 9999 0 0 0 0 0 0 0 0 0 0 0 0 0 0
   8       0 sda 1100 0 4096 110 500 0 4096 50 0 160 160 0 0 0 0 0 0
   8       1 sda1 950 0 3072 95 400 0 2048 40 0 135 135 0 0 0 0 0 0
   8      16 sdb 2100 0 6144 210 900 0 12288 90 0 300 300 0 0 0 0 0 0
   9       0 md3 200 0 1999999 0 200 0 1999999 0 0 0 0 0 0 0 0 0 0
";

pub const DF_POOL: &str = "\
Filesystem     1G-blocks  Used Available Use% Mounted on
/dev/md3           7334G 1874G     5460G  26% /volume/pool-a
";

/// Under the pool threshold (75 GB); system partitions look like this.
pub const DF_SMALL: &str = "\
Filesystem     1G-blocks  Used Available Use% Mounted on
/dev/md1             75G    3G       72G   4% /volume/.srv
";

pub const UDEVADM_ATA4: &str =
    "/devices/platform/soc/a000000.sata/ata4/host3/target3:0:0/3:0:0:0/block/sdc\n";
pub const UDEVADM_ATA2: &str =
    "/devices/platform/soc/a000000.sata/ata2/host1/target1:0:0/1:0:0:0/block/sdb\n";
pub const UDEVADM_USB: &str = "/devices/platform/soc/usb1/1-1/1-1:1.0/host9/block/sdh\n";

/// `smartctl -a -j` for a healthy SATA HDD.
pub const SMARTCTL_ATA: &str = r#"{
  "json_format_version": [1, 0],
  "smartctl": { "version": [7, 3], "exit_status": 0 },
  "device": { "name": "/dev/sdc", "type": "sat", "protocol": "ATA" },
  "model_name": "ST8000VN004-3CP101",
  "serial_number": "WWZ4ABCD",
  "firmware_version": "SC60",
  "user_capacity": { "blocks": 15628053168, "bytes": 8001563222016 },
  "rotation_rate": 7200,
  "smart_status": { "passed": true },
  "ata_smart_attributes": {
    "revision": 10,
    "table": [
      { "id": 5, "name": "Reallocated_Sector_Ct", "value": 100, "raw": { "value": 0, "string": "0" } },
      { "id": 9, "name": "Power_On_Hours", "value": 97, "raw": { "value": 3117, "string": "3117" } },
      { "id": 194, "name": "Temperature_Celsius", "value": 38, "raw": { "value": 38, "string": "38" } }
    ]
  },
  "power_on_time": { "hours": 3117 },
  "temperature": { "current": 38 }
}"#;

/// SAS / NVMe style report: `product` instead of `model_name`, no attribute table, failing health.
pub const SMARTCTL_NO_ATTRIBUTES: &str = r#"{
  "product": "SSD-CACHE",
  "serial_number": "S5XYZ",
  "user_capacity": { "bytes": 1099511627776 },
  "rotation_rate": 0,
  "smart_status": { "passed": false },
  "power_on_time": { "hours": 42 },
  "temperature": { "current": 51 }
}"#;

/// What smartctl prints when the device cannot be opened.
pub const SMARTCTL_ERROR: &str = r#"{
  "smartctl": {
    "messages": [{ "string": "Smartctl open device: /dev/sdz failed: No such device", "severity": "error" }],
    "exit_status": 2
  }
}"#;

/// Retained curve messages as they sit on the broker for `curve`.
pub fn curve_messages(topics: &Topics, curve: &FanCurveConfig) -> Vec<(String, String)> {
    CurveParam::ALL
        .into_iter()
        .map(|p| (topics.fan_curve(p), curve.get(p).to_string()))
        .collect()
}

/// Sensor-state messages for drive temperatures, keyed by bay.
pub fn drive_temperature_messages(topics: &Topics, temps: &[(&str, i64)]) -> Vec<(String, String)> {
    temps
        .iter()
        .map(|(bay, temp)| (topics.sensor_state(&format!("hdd_{bay}_temperature")), temp.to_string()))
        .collect()
}
