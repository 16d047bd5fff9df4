use crate::structure::Composition;
use itertools::iproduct;
use std::path::PathBuf;

/// Per-element data files the solver needs before any stage can run
#[derive(Debug, Clone)]
pub struct Provisioning {
    pub path: PathBuf,
    pub suffixes: Vec<String>,
}

impl Provisioning {
    pub fn new(path: PathBuf, suffixes: Vec<String>) -> Self {
        Self { path, suffixes }
    }

    pub fn file(&self, element: &str, suffix: &str) -> PathBuf {
        self.path.join(format!("{element}.{suffix}"))
    }

    /// every `<setups>/<element>.<suffix>` missing for `composition`
    pub fn missing(&self, composition: &Composition) -> Vec<PathBuf> {
        iproduct!(composition.elements(), self.suffixes.iter())
            .map(|(element, suffix)| self.file(element, suffix))
            .filter(|path| !path.is_file())
            .collect()
    }
}
