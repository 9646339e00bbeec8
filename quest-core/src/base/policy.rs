//! Policy.
use anyhow::Result;
use serde::de::DeserializeOwned;
use std::path::Path;

/// A policy predicting chunks of actions.
///
/// A chunk policy maps an observation to a sequence of future actions at once.
/// [`ChunkPolicy::get_action`] serves the chunk one step at a time, querying the
/// model only when the queue of pending actions is exhausted.
pub trait ChunkPolicy {
    /// Observation.
    type Obs;

    /// A chunk of actions for a batch of observations.
    type Chunk;

    /// Actions of a single control step for a batch of observations.
    type Act;

    /// Samples a full chunk of actions given an observation.
    fn sample_actions(&mut self, obs: &Self::Obs) -> Result<Self::Chunk>;

    /// Returns the action of the next control step.
    fn get_action(&mut self, obs: &Self::Obs) -> Result<Self::Act>;

    /// Clears pending actions, e.g., at the beginning of an episode.
    fn reset(&mut self);
}

/// A configurable object.
pub trait Configurable {
    /// Configuration.
    type Config: Clone + DeserializeOwned;

    /// Builds the object.
    fn build(config: Self::Config) -> Result<Self>
    where
        Self: Sized;

    /// Build the object with the configuration in the yaml file of the given path.
    fn build_from_path(path: impl AsRef<Path>) -> Result<Self>
    where
        Self: Sized,
    {
        let file = std::fs::File::open(path)?;
        let rdr = std::io::BufReader::new(file);
        let config = serde_yaml::from_reader(rdr)?;
        Self::build(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;
    use tempdir::TempDir;

    #[derive(Clone, Deserialize)]
    struct HorizonConfig {
        action_horizon: usize,
    }

    struct Horizon(usize);

    impl Configurable for Horizon {
        type Config = HorizonConfig;

        fn build(config: Self::Config) -> Result<Self> {
            Ok(Self(config.action_horizon))
        }
    }

    #[test]
    fn test_build_from_path() -> Result<()> {
        let tmp_dir = TempDir::new("configurable")?;
        let path = tmp_dir.path().join("horizon.yaml");
        std::fs::File::create(&path)?.write_all(b"action_horizon: 8\n")?;
        assert_eq!(Horizon::build_from_path(&path)?.0, 8);
        assert!(Horizon::build_from_path(tmp_dir.path().join("missing.yaml")).is_err());
        Ok(())
    }
}
