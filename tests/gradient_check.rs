//! Finite-difference checks of the recurrent network's gradients.

use birnn_classifier::model::{RnnClassifier, RnnConfig};
use birnn_classifier::nn::{Activation, BiLstm, LossKind, Module};
use birnn_classifier::tensor::{ops, Tensor, TensorData, TensorError};
use ndarray::{Array, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;

const EPS: TensorData = 1e-2;

fn sequence(batch: usize, steps: usize, features: usize) -> Tensor {
    let data = Array::from_shape_fn(IxDyn(&[batch, steps, features]), |ix| {
        ((ix[0] * 7 + ix[1] * 3 + ix[2]) as TensorData * 0.37).sin()
    });
    Tensor::new(data, false)
}

/// Compares the analytic gradient of `loss` with central differences for
/// every entry of every parameter.
fn check<F>(params: BTreeMap<String, Tensor>, loss: F)
where
    F: Fn() -> Result<Tensor, TensorError>,
{
    let out = loss().unwrap();
    out.backward().unwrap();
    let analytic: BTreeMap<String, ArrayD<TensorData>> = params
        .iter()
        .map(|(name, p)| (name.clone(), p.grad().expect("missing gradient")))
        .collect();

    for (name, param) in &params {
        let n = param.size();
        for k in 0..n {
            let original = param.data().iter().nth(k).copied().unwrap();
            *param.data_mut().iter_mut().nth(k).unwrap() = original + EPS;
            let plus = loss().unwrap().item().unwrap();
            *param.data_mut().iter_mut().nth(k).unwrap() = original - EPS;
            let minus = loss().unwrap().item().unwrap();
            *param.data_mut().iter_mut().nth(k).unwrap() = original;

            let numeric = (plus - minus) / (2.0 * EPS);
            let got = analytic[name].iter().nth(k).copied().unwrap();
            assert!(
                (got - numeric).abs() <= 1e-2 + 0.05 * numeric.abs(),
                "{}[{}]: analytic {} vs numeric {}",
                name,
                k,
                got,
                numeric
            );
        }
    }
}

#[test]
fn bilstm_gradients_match_finite_differences() {
    let mut rng = StdRng::seed_from_u64(17);
    let bi = BiLstm::new(2, &[3, 2], Activation::Tanh, &mut rng).unwrap();
    let x = sequence(2, 4, 2);
    let weights = Tensor::new(
        Array::from_shape_fn(IxDyn(&[2, 4]), |ix| 0.5 + ix[1] as TensorData * 0.25),
        false,
    );
    check(bi.parameters(), || {
        let out = bi.forward(&x)?;
        ops::sum(&ops::mul(&out, &weights)?)
    });
}

#[test]
fn classifier_loss_gradients_match_finite_differences() {
    let config = RnnConfig {
        rnn_units: vec![3],
        dense_layer_units: vec![4],
        dense_activation: Activation::Tanh,
        dropout_rates: vec![0.0],
        batch_size: 3,
        n_timesteps: 3,
        n_features: 1,
        n_classes: 2,
        seed: Some(5),
        loss_function: LossKind::RegressionError,
        ..RnnConfig::default()
    };
    let model = RnnClassifier::new(config).unwrap();
    model.eval();
    let x = sequence(3, 3, 1);
    let y = Tensor::new(
        Array::from_shape_fn(IxDyn(&[3, 2]), |ix| if ix[0] % 2 == ix[1] { 1.0 } else { 0.0 }),
        false,
    );
    check(model.parameters(), || {
        let preds = model.forward(&x)?;
        model.loss(&y, &preds)
    });
}
