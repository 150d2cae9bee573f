//! Per-model gradient accumulation with explicit update scopes.
//!
//! A backward pass in candle returns a [`GradStore`] holding gradients for
//! every variable the loss touched. Each sub-step of the training protocol
//! declares an [`UpdateScope`]; only gradients of the models that scope
//! admits are folded into the step's accumulators. The discriminator
//! therefore never sees the gradient of the generator's adversarial loss,
//! without any zero-grad bookkeeping.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::Tensor;
use candle_nn::VarMap;

use crate::error::{AasError, Result};
use crate::network::{ModelRole, ModelSet};

/// Models whose parameters may move because of one backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateScope {
    /// Generator adversarial sub-step.
    GeneratorOnly,
    /// Discriminator sub-steps (detached enhanced input, clean input).
    DiscriminatorOnly,
    /// Recognition sub-step: CTC gradients reach generator and recognizer.
    GeneratorAndRecognizer,
}

impl UpdateScope {
    /// Whether gradients of `role` are kept.
    pub fn admits(self, role: ModelRole) -> bool {
        matches!(
            (self, role),
            (UpdateScope::GeneratorOnly, ModelRole::Generator)
                | (UpdateScope::DiscriminatorOnly, ModelRole::Discriminator)
                | (UpdateScope::GeneratorAndRecognizer, ModelRole::Generator)
                | (UpdateScope::GeneratorAndRecognizer, ModelRole::Recognizer)
        )
    }
}

/// Gradients of one model, keyed by parameter name.
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    grads: HashMap<String, Tensor>,
}

impl Gradients {
    /// Pull the gradients of every variable in `vars` out of `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter store lock is poisoned.
    pub fn collect(store: &GradStore, vars: &VarMap) -> Result<Self> {
        let data = vars
            .data()
            .lock()
            .map_err(|_| AasError::training("parameter store lock poisoned"))?;

        let mut grads = HashMap::new();
        for (name, var) in data.iter() {
            if let Some(grad) = store.get(var) {
                grads.insert(name.clone(), grad.detach());
            }
        }
        Ok(Self { grads })
    }

    /// Add `other` into `self`, parameter by parameter.
    ///
    /// # Errors
    ///
    /// Returns an error if two gradients of the same name differ in shape.
    pub fn accumulate(&mut self, other: Gradients) -> Result<()> {
        for (name, grad) in other.grads {
            let summed = match self.grads.remove(&name) {
                Some(existing) => (&existing + &grad)?,
                None => grad,
            };
            self.grads.insert(name, summed);
        }
        Ok(())
    }

    /// Gradient of one parameter.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.grads.get(name)
    }

    /// Number of parameters with a gradient.
    pub fn len(&self) -> usize {
        self.grads.len()
    }

    /// Whether no parameter has a gradient.
    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Global L2 norm over all parameter gradients.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor reduction fails.
    pub fn norm(&self) -> Result<f32> {
        let mut sum_sq = 0f64;
        for grad in self.grads.values() {
            let sq = grad.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?;
            sum_sq += sq.to_scalar::<f64>()?;
        }
        Ok(sum_sq.sqrt() as f32)
    }
}

/// Gradient accumulators of one training step, one per model.
///
/// A fresh value is created at the start of every step, which is the
/// "clear all gradient accumulators" of the protocol.
#[derive(Debug, Default)]
pub struct StepGradients {
    /// Generator gradients.
    pub generator: Gradients,
    /// Discriminator gradients.
    pub discriminator: Gradients,
    /// Recognizer gradients.
    pub recognizer: Gradients,
}

impl StepGradients {
    /// Fold the gradients of `store` for every model `scope` admits.
    ///
    /// # Errors
    ///
    /// Returns an error if collection or accumulation fails.
    pub fn absorb(
        &mut self,
        scope: UpdateScope,
        store: &GradStore,
        models: &ModelSet,
    ) -> Result<()> {
        for role in ModelRole::ALL {
            if scope.admits(role) {
                let grads = Gradients::collect(store, models.vars(role))?;
                self.get_mut(role).accumulate(grads)?;
            }
        }
        Ok(())
    }

    /// Accumulator of a role.
    pub fn get(&self, role: ModelRole) -> &Gradients {
        match role {
            ModelRole::Generator => &self.generator,
            ModelRole::Discriminator => &self.discriminator,
            ModelRole::Recognizer => &self.recognizer,
        }
    }

    fn get_mut(&mut self, role: ModelRole) -> &mut Gradients {
        match role {
            ModelRole::Generator => &mut self.generator,
            ModelRole::Discriminator => &mut self.discriminator,
            ModelRole::Recognizer => &mut self.recognizer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use candle_core::{DType, Device, Var};

    struct Params {
        vars: VarMap,
    }

    impl Network for Params {
        fn forward(&self, xs: &Tensor) -> Result<Tensor> {
            Ok(xs.clone())
        }
        fn vars(&self) -> &VarMap {
            &self.vars
        }
        fn set_training(&mut self, _training: bool) {}
        fn is_training(&self) -> bool {
            true
        }
    }

    fn var_of(vars: &VarMap, name: &str) -> Var {
        vars.data().lock().unwrap().get(name).unwrap().clone()
    }

    /// Models whose single parameters all feed one loss.
    fn coupled_models() -> (ModelSet, GradStore) {
        let models = ModelSet::new(
            Box::new(Params { vars: varmap_with("g", &[1.0, 2.0]) }),
            Box::new(Params { vars: varmap_with("d", &[3.0]) }),
            Box::new(Params { vars: varmap_with("r", &[4.0, 5.0, 6.0]) }),
        );
        let g = var_of(models.vars(ModelRole::Generator), "g");
        let d = var_of(models.vars(ModelRole::Discriminator), "d");
        let r = var_of(models.vars(ModelRole::Recognizer), "r");

        let loss = (g.as_tensor().sum_all().unwrap()
            + d.as_tensor().sqr().unwrap().sum_all().unwrap()
            + r.as_tensor().sum_all().unwrap())
        .unwrap();
        let store = loss.backward().unwrap();
        (models, store)
    }

    #[test]
    fn test_scope_admission() {
        use ModelRole::*;
        assert!(UpdateScope::GeneratorOnly.admits(Generator));
        assert!(!UpdateScope::GeneratorOnly.admits(Discriminator));
        assert!(!UpdateScope::GeneratorOnly.admits(Recognizer));

        assert!(UpdateScope::DiscriminatorOnly.admits(Discriminator));
        assert!(!UpdateScope::DiscriminatorOnly.admits(Generator));
        assert!(!UpdateScope::DiscriminatorOnly.admits(Recognizer));

        assert!(UpdateScope::GeneratorAndRecognizer.admits(Generator));
        assert!(UpdateScope::GeneratorAndRecognizer.admits(Recognizer));
        assert!(!UpdateScope::GeneratorAndRecognizer.admits(Discriminator));
    }

    fn varmap_with(name: &str, values: &[f32]) -> VarMap {
        let vars = VarMap::new();
        let var = Var::from_vec(values.to_vec(), values.len(), &Device::Cpu).unwrap();
        vars.data().lock().unwrap().insert(name.to_string(), var);
        vars
    }

    #[test]
    fn test_collect_and_norm() {
        let vars = varmap_with("w", &[3.0, 4.0]);
        let w = vars.data().lock().unwrap().get("w").unwrap().clone();

        // d/dw sum(w * w) / 2 = w
        let loss = (w.as_tensor().sqr().unwrap().sum_all().unwrap() * 0.5).unwrap();
        let store = loss.backward().unwrap();

        let grads = Gradients::collect(&store, &vars).unwrap();
        assert_eq!(grads.len(), 1);
        assert!((grads.norm().unwrap() - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_accumulate_sums() {
        let vars = varmap_with("w", &[1.0, 2.0]);
        let w = vars.data().lock().unwrap().get("w").unwrap().clone();

        let loss = w.as_tensor().sum_all().unwrap();
        let store = loss.backward().unwrap();

        let mut total = Gradients::default();
        total.accumulate(Gradients::collect(&store, &vars).unwrap()).unwrap();
        total.accumulate(Gradients::collect(&store, &vars).unwrap()).unwrap();

        let grad = total.get("w").unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(grad, vec![2.0, 2.0]);
    }

    #[test]
    fn test_untouched_vars_have_no_gradient() {
        let vars = varmap_with("w", &[1.0]);
        let other = Var::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let store = other.as_tensor().sum_all().unwrap().backward().unwrap();

        let grads = Gradients::collect(&store, &vars).unwrap();
        assert!(grads.is_empty());
        assert_eq!(grads.norm().unwrap(), 0.0);
    }

    #[test]
    fn test_absorb_keeps_only_admitted_models() {
        let (models, store) = coupled_models();

        let mut grads = StepGradients::default();
        grads.absorb(UpdateScope::GeneratorOnly, &store, &models).unwrap();
        assert_eq!(grads.generator.len(), 1);
        assert!(grads.discriminator.is_empty());
        assert!(grads.recognizer.is_empty());

        grads.absorb(UpdateScope::DiscriminatorOnly, &store, &models).unwrap();
        assert_eq!(grads.generator.len(), 1);
        assert_eq!(grads.discriminator.get("d").unwrap().to_vec1::<f32>().unwrap(), vec![6.0]);
        assert!(grads.recognizer.is_empty());

        grads.absorb(UpdateScope::GeneratorAndRecognizer, &store, &models).unwrap();
        assert_eq!(grads.generator.get("g").unwrap().to_vec1::<f32>().unwrap(), vec![2.0, 2.0]);
        assert_eq!(grads.discriminator.get("d").unwrap().to_vec1::<f32>().unwrap(), vec![6.0]);
        assert_eq!(
            grads.get(ModelRole::Recognizer).get("r").unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0, 1.0, 1.0]
        );
    }
}
