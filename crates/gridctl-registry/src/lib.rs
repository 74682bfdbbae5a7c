//! Built-in skill registry: an on-disk store of `SKILL.md` documents
//! published to the router as a synthetic upstream. The registry is only
//! advertised while it has content (progressive disclosure).

pub mod server;
pub mod skill;
pub mod store;

pub use server::{REGISTRY_SERVER_NAME, RegistryServer};
pub use skill::{Skill, SkillState};
pub use store::{RegistryError, SkillStore};
