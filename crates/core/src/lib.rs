// nsm: session orchestration engine
//
// Puts a local development command behind an HTTPS URL on a custom domain:
// allocates ports, provisions certificates, configures name resolution,
// supervises the command and proxies traffic to it.

pub mod cert;
pub mod config;
pub mod dns;
pub mod error;
pub mod events;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod session;
pub mod tls;

/// Version reported to children (`NSM_VERSION`) and upstreams (`X-NSM-Version`).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use cert::{CertificateAuthority, CertificateProvider, CertificateRecord, Mkcert};
pub use config::{FeatureFlags, ProjectType, SessionConfig, Timeouts};
pub use dns::{DomainResolver, ResolverBackend};
pub use error::{CertificateProblem, Error, Result};
pub use events::EventBus;
pub use nsm_protocol::{LogSource, PortDescriptor, SessionEvent, StepName, StepStatus};
pub use ports::PortAllocator;
pub use process::{ProcessState, ProcessSupervisor, StopOutcome};
pub use proxy::{ProxyConfig, ReverseProxy};
pub use session::{Session, SessionState, SessionStatus};
