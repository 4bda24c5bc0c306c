use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ONNX Runtime execution backends, in the order they may be tried.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionBackend {
    Cuda,
    DirectMl,
    CoreMl,
    Cpu,
}

impl ExecutionBackend {
    pub fn name(self) -> &'static str {
        match self {
            ExecutionBackend::Cuda => "cuda",
            ExecutionBackend::DirectMl => "directml",
            ExecutionBackend::CoreMl => "coreml",
            ExecutionBackend::Cpu => "cpu",
        }
    }

    /// Provider registration that fails session creation instead of
    /// silently falling back, so the caller can move to the next backend.
    pub fn dispatch(self) -> ort::execution_providers::ExecutionProviderDispatch {
        use ort::execution_providers as ep;
        let dispatch = match self {
            ExecutionBackend::Cuda => ep::CUDAExecutionProvider::default().build(),
            ExecutionBackend::DirectMl => ep::DirectMLExecutionProvider::default().build(),
            ExecutionBackend::CoreMl => ep::CoreMLExecutionProvider::default().build(),
            ExecutionBackend::Cpu => ep::CPUExecutionProvider::default().build(),
        };
        dispatch.error_on_failure()
    }
}

impl fmt::Display for ExecutionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Backends worth trying on this platform, most capable first.
pub fn preferred_backends() -> Vec<ExecutionBackend> {
    #[cfg(target_os = "macos")]
    {
        vec![ExecutionBackend::CoreMl, ExecutionBackend::Cpu]
    }
    #[cfg(target_os = "windows")]
    {
        vec![
            ExecutionBackend::Cuda,
            ExecutionBackend::DirectMl,
            ExecutionBackend::Cpu,
        ]
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        vec![ExecutionBackend::Cuda, ExecutionBackend::Cpu]
    }
}

/// A value together with the backend that produced it.
#[derive(Debug)]
pub struct Initialized<T> {
    pub value: T,
    pub backend: ExecutionBackend,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendAttempt {
    pub backend: ExecutionBackend,
    pub reason: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BackendError {
    #[error("no execution backends configured")]
    Empty,
    #[error("no execution backend could be initialized: {}", describe(.attempts))]
    Exhausted { attempts: Vec<BackendAttempt> },
}

fn describe(attempts: &[BackendAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{} ({})", a.backend, a.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Runs `init` for each backend in order and returns the first success.
pub fn initialize_with_fallback<T, E: fmt::Display>(
    backends: &[ExecutionBackend],
    mut init: impl FnMut(ExecutionBackend) -> Result<T, E>,
) -> Result<Initialized<T>, BackendError> {
    if backends.is_empty() {
        return Err(BackendError::Empty);
    }
    let mut attempts = Vec::new();
    for &backend in backends {
        match init(backend) {
            Ok(value) => {
                log::info!("Using {backend} execution backend");
                return Ok(Initialized { value, backend });
            }
            Err(e) => {
                log::warn!("Execution backend {backend} unavailable: {e}");
                attempts.push(BackendAttempt {
                    backend,
                    reason: e.to_string(),
                });
            }
        }
    }
    Err(BackendError::Exhausted { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_backends_end_with_cpu() {
        let backends = preferred_backends();
        assert_eq!(backends.last(), Some(&ExecutionBackend::Cpu));
    }

    #[test]
    fn test_first_working_backend_is_used() {
        let mut tried = Vec::new();
        let result = initialize_with_fallback(
            &[ExecutionBackend::Cuda, ExecutionBackend::DirectMl, ExecutionBackend::Cpu],
            |backend| {
                tried.push(backend);
                if backend == ExecutionBackend::Cpu {
                    Ok(7)
                } else {
                    Err("not available")
                }
            },
        )
        .unwrap();

        assert_eq!(result.value, 7);
        assert_eq!(result.backend, ExecutionBackend::Cpu);
        assert_eq!(
            tried,
            vec![ExecutionBackend::Cuda, ExecutionBackend::DirectMl, ExecutionBackend::Cpu]
        );
    }

    #[test]
    fn test_exhausted_reports_every_attempt() {
        let result = initialize_with_fallback::<(), _>(
            &[ExecutionBackend::Cuda, ExecutionBackend::Cpu],
            |backend| Err(format!("{backend} broken")),
        );
        let err = result.unwrap_err();
        assert_eq!(
            err,
            BackendError::Exhausted {
                attempts: vec![
                    BackendAttempt {
                        backend: ExecutionBackend::Cuda,
                        reason: "cuda broken".into()
                    },
                    BackendAttempt {
                        backend: ExecutionBackend::Cpu,
                        reason: "cpu broken".into()
                    },
                ]
            }
        );
        assert!(err.to_string().contains("cuda (cuda broken)"));
    }

    #[test]
    fn test_empty_backend_list() {
        let result = initialize_with_fallback::<(), String>(&[], |_| Ok(()));
        assert_eq!(result.unwrap_err(), BackendError::Empty);
    }

    #[test]
    fn test_backend_names_round_trip_through_serde() {
        let json = serde_json::to_string(&ExecutionBackend::DirectMl).unwrap();
        assert_eq!(json, "\"directml\"");
        let back: ExecutionBackend = serde_json::from_str("\"coreml\"").unwrap();
        assert_eq!(back, ExecutionBackend::CoreMl);
    }
}
