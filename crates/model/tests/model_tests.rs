use candle_core::{DType, Device, Result, Tensor};
use model::{Architecture, Classifier, ModelConfig};

fn build(architecture: Architecture) -> Result<Classifier> {
    Classifier::new(ModelConfig::new(architecture, 18))
}

#[test]
fn base_model_produces_logits() -> Result<()> {
    let model = build(Architecture::BaseModel)?;
    let images = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &Device::Cpu)?;

    let logits = model.forward(&images)?;

    assert_eq!(logits.dims(), &[2, 18]);
    assert_eq!(logits.dtype(), DType::F32);
    Ok(())
}

#[test]
fn residual_model_handles_odd_sizes() -> Result<()> {
    let model = build(Architecture::RBaseModel)?;
    let images = Tensor::randn(0f32, 1.0, (3, 3, 20, 14), &Device::Cpu)?;

    let logits = model.forward(&images)?;

    assert_eq!(logits.dims(), &[3, 18]);
    Ok(())
}

#[test]
fn eval_mode_is_deterministic() -> Result<()> {
    let model = build(Architecture::BaseModel)?;
    model.set_training(false);
    let images = Tensor::randn(0f32, 1.0, (1, 3, 16, 16), &Device::Cpu)?;

    let a = model.forward(&images)?.to_vec2::<f32>()?;
    let b = model.forward(&images)?.to_vec2::<f32>()?;

    assert_eq!(a, b);
    Ok(())
}

#[test]
fn parameters_are_sorted_and_named() -> Result<()> {
    let model = build(Architecture::BaseModel)?;
    let names: Vec<String> = model.parameters().into_iter().map(|(n, _)| n).collect();

    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    assert!(names.contains(&"conv1.weight".to_string()));
    assert!(names.contains(&"fc.bias".to_string()));
    assert!(model.num_parameters() > 0);
    Ok(())
}

#[test]
fn rejects_wrong_channel_count() -> Result<()> {
    let model = build(Architecture::BaseModel)?;
    let images = Tensor::zeros((1, 1, 16, 16), DType::F32, &Device::Cpu)?;
    assert!(model.forward(&images).is_err());
    Ok(())
}

#[test]
fn registry_parses_names() {
    assert_eq!(
        "RBaseModel".parse::<Architecture>().unwrap(),
        Architecture::RBaseModel
    );
    assert!("ResNet152".parse::<Architecture>().is_err());
}
