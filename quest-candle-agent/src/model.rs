//! Interface of neural networks composing the policy.
use anyhow::Result;
use candle_nn::VarBuilder;

/// Neural network model not owing its [`VarMap`] internally.
///
/// All sub-models of a policy register their variables in a single [`VarMap`]
/// through the [`VarBuilder`] given to [`SubModel1::build`]. The prefix of the
/// builder determines the names used later for optimizer parameter groups.
///
/// [`VarMap`]: candle_nn::VarMap
pub trait SubModel1 {
    /// Configuration from which [`SubModel1`] is constructed.
    type Config;

    /// Input of the [`SubModel1`].
    type Input;

    /// Output of the [`SubModel1`].
    type Output;

    /// Builds [`SubModel1`] with [`VarBuilder`] and [`SubModel1::Config`].
    fn build(vb: VarBuilder, config: Self::Config) -> Result<Self>
    where
        Self: Sized;

    /// A generalized forward function.
    ///
    /// `train` switches layers like dropout and batch normalization to their
    /// training behaviour.
    fn forward_t(&self, input: &Self::Input, train: bool) -> Result<Self::Output>;

    /// Forward pass in evaluation mode.
    fn forward(&self, input: &Self::Input) -> Result<Self::Output> {
        self.forward_t(input, false)
    }
}

/// Neural network model not owing its [`VarMap`] internally.
///
/// The difference from [`SubModel1`] is that this trait takes two inputs.
///
/// [`VarMap`]: candle_nn::VarMap
pub trait SubModel2 {
    /// Configuration from which [`SubModel2`] is constructed.
    type Config;

    /// Input of the [`SubModel2`].
    type Input1;

    /// Input of the [`SubModel2`].
    type Input2;

    /// Output of the [`SubModel2`].
    type Output;

    /// Builds [`SubModel2`].
    fn build(vb: VarBuilder, config: Self::Config) -> Result<Self>
    where
        Self: Sized;

    /// A generalized forward function.
    fn forward_t(
        &self,
        input1: &Self::Input1,
        input2: &Self::Input2,
        train: bool,
    ) -> Result<Self::Output>;

    /// Forward pass in evaluation mode.
    fn forward(&self, input1: &Self::Input1, input2: &Self::Input2) -> Result<Self::Output> {
        self.forward_t(input1, input2, false)
    }
}
