use std::{fs, path::Path};

use image::{Rgb, RgbImage};
use tempfile::tempdir;
use training::{
    checkpoint::{load_manifest, BEST_STEM, LAST_STEM},
    Precision, Trainer, TrainingConfig, TrainingError, TrainingOutcome,
};

const FILES: [&str; 7] = [
    "mask1", "mask2", "mask3", "mask4", "mask5", "incorrect_mask", "normal",
];

fn write_dataset(root: &Path) {
    let profiles = [
        ("000001_female_Asian_45", 20u8),
        ("000002_male_Asian_20", 60),
        ("000003_male_Asian_62", 100),
        ("000004_female_Asian_25", 140),
        ("000005_male_Asian_33", 180),
        ("000006_female_Asian_70", 220),
    ];
    for (name, shade) in profiles {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (idx, stem) in FILES.iter().enumerate() {
            let image = RgbImage::from_fn(12, 16, |x, y| {
                Rgb([shade, (idx as u8) * 30, ((x + y) * 8) as u8])
            });
            image.save(dir.join(format!("{stem}.png"))).unwrap();
        }
    }
}

fn tiny_config(data_dir: &Path, model_dir: &Path) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.data.data_dir = data_dir.to_path_buf();
    config.data.resize = 16;
    config.data.val_ratio = 0.34;
    config.data.batch_size = 8;
    config.data.valid_batch_size = 8;
    config.data.num_workers = 2;
    config.model.architecture = "BaseModel".into();
    config.optimizer.learning_rate = 0.01;
    config.runtime.epochs = 2;
    config.runtime.precision = Precision::Fp32;
    config.runtime.log_interval = 2;
    config.runtime.num_early_stop = 5;
    config.runtime.checkpoint_every_n_epochs = 2;
    config.runtime.model_dir = model_dir.to_path_buf();
    config
}

#[test]
fn trains_and_writes_run_artifacts() {
    let tmp = tempdir().unwrap();
    let data_dir = tmp.path().join("images");
    let model_dir = tmp.path().join("model");
    write_dataset(&data_dir);

    let mut config = tiny_config(&data_dir, &model_dir);
    config.augment.mixup_alpha = 0.4;
    config.augment.mixup_threshold = 0.5;

    let mut trainer = Trainer::new(config.clone()).unwrap();
    let report = trainer.train().unwrap();

    assert_eq!(report.outcome, TrainingOutcome::EpochsExhausted);
    assert_eq!(report.epochs_completed, 2);
    assert_eq!(report.run_dir, model_dir.join("exp"));

    let run_dir = &report.run_dir;
    let saved: TrainingConfig =
        serde_json::from_str(&fs::read_to_string(run_dir.join("config.json")).unwrap()).unwrap();
    assert_eq!(saved.runtime.epochs, 2);

    assert!(run_dir.join("last.safetensors").is_file());
    assert_eq!(load_manifest(run_dir, LAST_STEM).unwrap().epoch, 1);
    assert!(run_dir.join("epoch1.safetensors").is_file());
    assert!(!run_dir.join("epoch0.safetensors").exists());

    if report.best.f1 > 0.0 {
        let best = load_manifest(run_dir, BEST_STEM).unwrap();
        assert_eq!(best.metrics.f1, report.best.f1);
    } else {
        assert!(!run_dir.join("best.safetensors").exists());
    }

    let event_files = fs::read_dir(run_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("events.out.tfevents.")
        })
        .count();
    assert_eq!(event_files, 1);

    // A second run lands next to the first and can start from its weights.
    config.model.init_weights = Some(run_dir.join("last.safetensors"));
    let second = Trainer::new(config).unwrap();
    assert_eq!(second.run_dir(), model_dir.join("exp2"));
    let evaluation = second.evaluate().unwrap();
    assert!(evaluation.summary.samples > 0);
    assert!(evaluation.grid.is_some());
}

#[test]
fn stops_once_f1_stalls() {
    let tmp = tempdir().unwrap();
    let data_dir = tmp.path().join("images");
    write_dataset(&data_dir);

    // The weights barely move, so validation f1 cannot improve after epoch 0.
    let mut config = tiny_config(&data_dir, &tmp.path().join("model"));
    config.optimizer.learning_rate = 1e-12;
    config.runtime.epochs = 5;
    config.runtime.num_early_stop = 1;

    let report = Trainer::new(config).unwrap().train().unwrap();
    let TrainingOutcome::EarlyStopTriggered { epoch } = report.outcome else {
        panic!("expected early stop, got {:?}", report.outcome);
    };
    assert!(epoch <= 1);
    assert_eq!(report.epochs_completed, epoch + 1);
    assert!(report.epochs_completed < 5);
    assert_eq!(load_manifest(&report.run_dir, LAST_STEM).unwrap().epoch, epoch);
}

#[test]
fn unknown_component_fails_before_touching_data() {
    let tmp = tempdir().unwrap();
    let mut config = tiny_config(&tmp.path().join("missing"), &tmp.path().join("model"));
    config.data.sampler = "round-robin".into();

    match Trainer::new(config) {
        Err(TrainingError::Validation(messages)) => {
            assert!(messages.iter().any(|m| m.contains("round-robin")));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected validation failure"),
    }
    assert!(!tmp.path().join("model").exists());
}
