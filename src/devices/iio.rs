//! DHT11 temperature/humidity sensor exposed through the Linux IIO sysfs
//! interface (`dht11` overlay on the Raspberry Pi 5).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{DeviceError, EnvReading, EnvironmentSensor};

pub const DEFAULT_IIO_DEVICE: &str = "/sys/bus/iio/devices/iio:device0";

const TEMPERATURE_FILE: &str = "in_temp_input";
const HUMIDITY_FILE: &str = "in_humidityrelative_input";

const EIO: i32 = 5;

#[derive(Debug, Clone)]
pub struct IioEnvironmentSensor {
    device_dir: PathBuf,
}

impl IioEnvironmentSensor {
    pub fn new(device_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_dir: device_dir.into(),
        }
    }

    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    /// Both channels report milli-units as a single integer on the first line.
    fn read_milli(&self, file: &str) -> Result<f64, DeviceError> {
        let path = self.device_dir.join(file);
        let raw = fs::read_to_string(&path).map_err(|e| read_error(&path, e))?;
        let first = raw.lines().next().unwrap_or("").trim();
        // Some driver versions return garbage instead of EIO on a missed read.
        let value: i64 = first.parse().map_err(|_| {
            DeviceError::SensorUnavailable(format!("{}: unreadable value {:?}", path.display(), first))
        })?;
        Ok(value as f64 / 1000.0)
    }
}

/// A missing device or a missed DHT11 timing window (EIO) is an ordinary
/// unavailable reading; anything else is a real I/O fault.
fn read_error(path: &Path, e: io::Error) -> DeviceError {
    if e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(EIO) {
        DeviceError::SensorUnavailable(format!("{}: {}", path.display(), e))
    } else {
        DeviceError::Io(e)
    }
}

impl Default for IioEnvironmentSensor {
    fn default() -> Self {
        Self::new(DEFAULT_IIO_DEVICE)
    }
}

impl EnvironmentSensor for IioEnvironmentSensor {
    fn read(&self) -> Result<EnvReading, DeviceError> {
        let temperature_c = self.read_milli(TEMPERATURE_FILE)?;
        let humidity_pct = self.read_milli(HUMIDITY_FILE)?;
        Ok(EnvReading {
            temperature_c,
            humidity_pct,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("arod-iio-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_reads_milli_units() {
        let dir = scratch_dir("ok");
        fs::write(dir.join(TEMPERATURE_FILE), "22500\n").unwrap();
        fs::write(dir.join(HUMIDITY_FILE), "41000\n").unwrap();

        let reading = IioEnvironmentSensor::new(&dir).read().unwrap();
        assert!((reading.temperature_c - 22.5).abs() < 1e-12);
        assert!((reading.humidity_pct - 41.0).abs() < 1e-12);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_missing_device_is_unavailable() {
        let sensor = IioEnvironmentSensor::new("/nonexistent/iio:device9");
        assert!(matches!(sensor.read(), Err(DeviceError::SensorUnavailable(_))));
    }

    #[test]
    fn test_unreadable_channel_is_io_fault() {
        let dir = scratch_dir("unreadable");
        // A directory where the channel file should be fails at read time.
        fs::create_dir_all(dir.join(TEMPERATURE_FILE)).unwrap();
        fs::write(dir.join(HUMIDITY_FILE), "41000\n").unwrap();

        let sensor = IioEnvironmentSensor::new(&dir);
        assert!(matches!(sensor.read(), Err(DeviceError::Io(_))));
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_timing_miss_is_unavailable() {
        let err = read_error(Path::new("in_temp_input"), io::Error::from_raw_os_error(EIO));
        assert!(matches!(err, DeviceError::SensorUnavailable(_)));
    }

    #[test]
    fn test_garbage_value_is_unavailable() {
        let dir = scratch_dir("garbage");
        fs::write(dir.join(TEMPERATURE_FILE), "not-a-number\n").unwrap();
        fs::write(dir.join(HUMIDITY_FILE), "41000\n").unwrap();

        let sensor = IioEnvironmentSensor::new(&dir);
        assert!(matches!(sensor.read(), Err(DeviceError::SensorUnavailable(_))));
        fs::remove_dir_all(dir).ok();
    }
}
