use rand::Rng;

use crate::{
    error::{Error, Result},
    graph::{Graph, Var},
    layers::Mode,
};

/// Zeroes activations with probability `p` while training; identity in eval.
#[derive(Clone, Copy, Debug)]
pub struct Dropout {
    p: f32,
}

impl Dropout {
    pub fn new(p: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(Error::InvalidConfig(format!(
                "dropout probability must be in [0, 1), got {p}"
            )));
        }

        Ok(Self { p })
    }

    pub fn forward<'g>(
        &self,
        g: &'g Graph,
        x: Var<'g>,
        mode: Mode,
        rng: &mut impl Rng,
    ) -> Result<Var<'g>> {
        match mode {
            Mode::Train => g.dropout(x, self.p, rng),
            Mode::Eval => Ok(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::tensor::{Shape, Tensor};

    #[test]
    fn eval_is_identity() {
        let g = Graph::new();
        let x = g.constant(Tensor::from_samples(Shape::flat(3), &[vec![1.0, 2.0, 3.0]]).unwrap());
        let y = Dropout::new(0.4)
            .unwrap()
            .forward(&g, x, Mode::Eval, &mut StdRng::seed_from_u64(0))
            .unwrap();

        assert_eq!(y.value(), x.value());
    }

    #[test]
    fn rejects_certain_drop() {
        assert!(Dropout::new(1.0).is_err());
    }
}
