use std::{
    fs::{self, File},
    io::{BufWriter, Cursor, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use image::{DynamicImage, ImageFormat, RgbImage};
use prost::Message;

use crate::{
    metrics::{EvaluationSummary, IntervalSummary},
    state::BestMetrics,
    TrainingError,
};

const FILE_VERSION: &str = "brain.Event:2";

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(tensorboard_dir: Option<PathBuf>, flush_every: usize) -> Self {
        Self {
            tensorboard_dir,
            tensorboard_flush_every_n: flush_every.max(1),
        }
    }
}

/// Position of a training interval inside the run, for console output.
#[derive(Debug, Clone, Copy)]
pub struct IntervalPosition {
    pub epoch: usize,
    pub epochs: usize,
    pub batch: usize,
    pub batches: usize,
    pub step: usize,
}

/// Console lines through `log` plus an optional TensorBoard event file.
pub struct Logger {
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self { tensorboard })
    }

    pub fn event_file(&self) -> Option<&Path> {
        self.tensorboard.as_ref().map(|writer| writer.path.as_path())
    }

    pub fn log_train_interval(&mut self, at: IntervalPosition, lr: f64, summary: &IntervalSummary) {
        log::info!(
            "Epoch[{}/{}]({}/{}) || training loss {:.4} || training accuracy {:4.2}% || training f1 {:.4} || lr {:.6}",
            at.epoch,
            at.epochs,
            at.batch,
            at.batches,
            summary.loss,
            summary.accuracy * 100.0,
            summary.f1,
            lr
        );

        let step = at.step as i64;
        self.scalars(
            step,
            &[
                ("Train/loss", summary.loss),
                ("Train/accuracy", summary.accuracy),
                ("Train/f1", summary.f1),
                ("Train/lr", lr),
            ],
        );
    }

    pub fn log_evaluation(&mut self, epoch: usize, summary: &EvaluationSummary, best: &BestMetrics) {
        log::info!(
            "[Val] acc: {:4.2}%, loss: {:.4}, f1: {:.4} || best acc: {:4.2}%, best loss: {:.4}, best f1: {:.4}",
            summary.accuracy * 100.0,
            summary.loss,
            summary.f1,
            best.accuracy * 100.0,
            best.loss,
            best.f1
        );

        self.scalars(
            epoch as i64,
            &[
                ("Val/loss", summary.loss),
                ("Val/accuracy", summary.accuracy),
                ("Val/f1", summary.f1),
            ],
        );
    }

    pub fn log_image(&mut self, tag: &str, step: usize, image: &RgbImage) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.write_image(tag, step as i64, image) {
                log::warn!("dropping tensorboard image {tag}: {err}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                log::warn!("{err}");
            }
        }
    }

    fn scalars(&mut self, step: i64, values: &[(&str, f64)]) {
        let Some(writer) = self.tensorboard.as_mut() else {
            return;
        };
        for (tag, value) in values {
            if let Err(err) = writer.write_scalar(tag, step, *value) {
                log::warn!("dropping tensorboard scalar {tag}: {err}");
            }
        }
    }
}

struct TensorBoardWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some(FILE_VERSION.to_string()),
            summary: None,
        })?;
        writer.flush()?;
        Ok(writer)
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        self.write_summary(summary::Value {
            tag: tag.to_string(),
            simple_value: Some(value as f32),
            image: None,
        }, step)
    }

    fn write_image(&mut self, tag: &str, step: i64, image: &RgbImage) -> Result<(), TrainingError> {
        let mut encoded = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image.clone())
            .write_to(&mut encoded, ImageFormat::Png)
            .map_err(|err| TrainingError::runtime(format!("failed to encode PNG: {err}")))?;
        self.write_summary(summary::Value {
            tag: tag.to_string(),
            simple_value: None,
            image: Some(summary::Image {
                height: image.height() as i32,
                width: image.width() as i32,
                colorspace: 3,
                encoded_image_string: encoded.into_inner(),
            }),
        }, step)
    }

    fn write_summary(&mut self, value: summary::Value, step: i64) -> Result<(), TrainingError> {
        self.write_event(&Event {
            wall_time: current_wall_time(),
            step,
            file_version: None,
            summary: Some(Summary { value: vec![value] }),
        })
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let record = frame_record(&buffer);
        self.writer.write_all(&record).map_err(|err| {
            TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
        })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// TFRecord framing: length, masked CRC of the length, payload, masked CRC
/// of the payload. Integers are little endian.
fn frame_record(data: &[u8]) -> Vec<u8> {
    let len_bytes = (data.len() as u64).to_le_bytes();
    let mut record = Vec::with_capacity(data.len() + 16);
    record.extend_from_slice(&len_bytes);
    record.extend_from_slice(&masked_crc32(&len_bytes).to_le_bytes());
    record.extend_from_slice(data);
    record.extend_from_slice(&masked_crc32(data).to_le_bytes());
    record
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
        #[prost(message, optional, tag = "4")]
        pub image: Option<Image>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Image {
        #[prost(int32, tag = "1")]
        pub height: i32,
        #[prost(int32, tag = "2")]
        pub width: i32,
        #[prost(int32, tag = "3")]
        pub colorspace: i32,
        #[prost(bytes = "vec", tag = "4")]
        pub encoded_image_string: Vec<u8>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_events(path: &Path) -> Vec<Event> {
        let bytes = fs::read(path).unwrap();
        let mut events = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let len_bytes: [u8; 8] = bytes[offset..offset + 8].try_into().unwrap();
            let len = u64::from_le_bytes(len_bytes) as usize;
            let len_crc = u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().unwrap());
            assert_eq!(len_crc, masked_crc32(&len_bytes));
            let data = &bytes[offset + 12..offset + 12 + len];
            let data_crc = u32::from_le_bytes(
                bytes[offset + 12 + len..offset + 16 + len].try_into().unwrap(),
            );
            assert_eq!(data_crc, masked_crc32(data));
            events.push(Event::decode(data).unwrap());
            offset += 16 + len;
        }
        events
    }

    #[test]
    fn writes_framed_scalar_and_image_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(LoggingSettings::from_config(Some(dir.path().into()), 1)).unwrap();
        logger.log_evaluation(
            3,
            &EvaluationSummary {
                loss: 0.5,
                accuracy: 0.75,
                f1: 0.25,
                samples: 4,
            },
            &BestMetrics::default(),
        );
        logger.log_image("results", 3, &RgbImage::from_pixel(4, 2, image::Rgb([0, 255, 0])));
        logger.flush();

        let path = logger.event_file().unwrap().to_path_buf();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("events.out.tfevents."));
        let events = read_events(&path);
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].file_version.as_deref(), Some(FILE_VERSION));

        let scalars: Vec<(String, f32)> = events[1..4]
            .iter()
            .map(|event| {
                assert_eq!(event.step, 3);
                let value = &event.summary.as_ref().unwrap().value[0];
                (value.tag.clone(), value.simple_value.unwrap())
            })
            .collect();
        assert_eq!(
            scalars,
            vec![
                ("Val/loss".to_string(), 0.5),
                ("Val/accuracy".to_string(), 0.75),
                ("Val/f1".to_string(), 0.25)
            ]
        );

        let image = events[4].summary.as_ref().unwrap().value[0]
            .image
            .as_ref()
            .unwrap();
        assert_eq!((image.width, image.height), (4, 2));
        assert!(image.encoded_image_string.starts_with(b"\x89PNG"));
    }

    #[test]
    fn masked_crc_matches_known_value() {
        // crc32("") == 0, masked by rotation and the tfrecord delta.
        assert_eq!(masked_crc32(b""), 0xa282_ead8);
    }

    #[test]
    fn console_only_logger_has_no_event_file() {
        let mut logger = Logger::new(LoggingSettings::from_config(None, 10)).unwrap();
        logger.log_train_interval(
            IntervalPosition {
                epoch: 0,
                epochs: 1,
                batch: 1,
                batches: 1,
                step: 0,
            },
            0.1,
            &IntervalSummary {
                loss: 1.0,
                accuracy: 0.5,
                f1: 0.5,
            },
        );
        assert!(logger.event_file().is_none());
    }
}
