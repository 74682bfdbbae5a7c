use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::skill::{Skill, SkillState};

const SKILL_FILE_NAME: &str = "SKILL.md";

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("skill '{0}' already exists")]
    Conflict(String),

    #[error("skill '{0}' not found")]
    NotFound(String),

    #[error("invalid skill: {0}")]
    Invalid(String),

    #[error("registry io error: {0}")]
    Io(#[from] std::io::Error),
}

/// On-disk skill store: `<dir>/<name>/SKILL.md` per skill, mirrored in
/// memory. Mutations write through to disk (tmp + rename) before the
/// in-memory map is updated.
#[derive(Debug)]
pub struct SkillStore {
    dir: PathBuf,
    skills: RwLock<HashMap<String, Skill>>,
}

impl SkillStore {
    /// Open a store rooted at `dir`, creating the directory and scanning
    /// any existing skills.
    pub fn open(dir: &Path) -> Result<Self, RegistryError> {
        std::fs::create_dir_all(dir)?;

        let mut skills = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path().join(SKILL_FILE_NAME);
            if !path.is_file() {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            match Skill::parse(&raw) {
                Ok(skill) => {
                    skills.insert(skill.name().to_string(), skill);
                }
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "skipping unparseable skill");
                }
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            skills: RwLock::new(skills),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn count(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn get(&self, name: &str) -> Option<Skill> {
        self.read_map().get(name).cloned()
    }

    /// All skills, sorted by name for stable listings.
    pub fn list(&self) -> Vec<Skill> {
        let mut skills: Vec<Skill> = self.read_map().values().cloned().collect();
        skills.sort_by(|a, b| a.name().cmp(b.name()));
        skills
    }

    /// Active skills only (the ones advertised as tools).
    pub fn active(&self) -> Vec<Skill> {
        self.list().into_iter().filter(Skill::is_active).collect()
    }

    /// Create a new skill; duplicate names are a conflict.
    pub fn create(&self, skill: Skill) -> Result<(), RegistryError> {
        if skill.name().is_empty() {
            return Err(RegistryError::Invalid("empty skill name".to_string()));
        }
        {
            let map = self.read_map();
            if map.contains_key(skill.name()) {
                return Err(RegistryError::Conflict(skill.name().to_string()));
            }
        }
        self.persist(&skill)?;
        self.write_map().insert(skill.name().to_string(), skill);
        Ok(())
    }

    /// Replace an existing skill.
    pub fn update(&self, name: &str, mut skill: Skill) -> Result<(), RegistryError> {
        if !self.read_map().contains_key(name) {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        skill.meta.name = name.to_string();
        self.persist(&skill)?;
        self.write_map().insert(name.to_string(), skill);
        Ok(())
    }

    /// Delete a skill and its directory.
    pub fn delete(&self, name: &str) -> Result<(), RegistryError> {
        if self.write_map().remove(name).is_none() {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        let skill_dir = self.dir.join(name);
        if skill_dir.exists() {
            std::fs::remove_dir_all(&skill_dir)?;
        }
        Ok(())
    }

    /// Transition a skill's state (activate / disable / back to draft).
    pub fn set_state(&self, name: &str, state: SkillState) -> Result<(), RegistryError> {
        let mut skill = self
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        skill.meta.state = state;
        self.persist(&skill)?;
        self.write_map().insert(name.to_string(), skill);
        Ok(())
    }

    fn persist(&self, skill: &Skill) -> Result<(), RegistryError> {
        let skill_dir = self.dir.join(skill.name());
        std::fs::create_dir_all(&skill_dir)?;
        let path = skill_dir.join(SKILL_FILE_NAME);
        let tmp = skill_dir.join(format!("{SKILL_FILE_NAME}.tmp"));
        std::fs::write(&tmp, skill.render())?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Skill>> {
        self.skills.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Skill>> {
        self.skills.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn active_skill(name: &str) -> Skill {
        let mut skill = Skill::new(name, format!("{name} description"));
        skill.meta.state = SkillState::Active;
        skill.body = format!("Instructions for {name}.");
        skill
    }

    #[test]
    fn create_persists_and_rescan_finds_it() {
        let dir = tempdir().unwrap();
        let store = SkillStore::open(dir.path()).unwrap();
        store.create(active_skill("greet")).unwrap();

        assert!(dir.path().join("greet").join("SKILL.md").is_file());

        let reopened = SkillStore::open(dir.path()).unwrap();
        assert_eq!(reopened.count(), 1);
        assert_eq!(reopened.get("greet").unwrap().meta.description, "greet description");
    }

    #[test]
    fn duplicate_create_is_conflict() {
        let dir = tempdir().unwrap();
        let store = SkillStore::open(dir.path()).unwrap();
        store.create(active_skill("greet")).unwrap();

        let err = store.create(active_skill("greet")).unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(name) if name == "greet"));
    }

    #[test]
    fn delete_removes_disk_state() {
        let dir = tempdir().unwrap();
        let store = SkillStore::open(dir.path()).unwrap();
        store.create(active_skill("greet")).unwrap();
        store.delete("greet").unwrap();

        assert!(store.is_empty());
        assert!(!dir.path().join("greet").exists());
        assert!(matches!(
            store.delete("greet"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn state_transition_is_persisted() {
        let dir = tempdir().unwrap();
        let store = SkillStore::open(dir.path()).unwrap();
        store.create(active_skill("greet")).unwrap();
        store.set_state("greet", SkillState::Disabled).unwrap();

        assert!(store.active().is_empty());

        let reopened = SkillStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get("greet").unwrap().meta.state, SkillState::Disabled);
    }

    #[test]
    fn active_filters_drafts() {
        let dir = tempdir().unwrap();
        let store = SkillStore::open(dir.path()).unwrap();
        store.create(active_skill("greet")).unwrap();
        store.create(Skill::new("wip", "not ready")).unwrap();

        let active = store.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name(), "greet");
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn unparseable_skill_is_skipped_on_scan() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken").join("SKILL.md"), "no front matter").unwrap();

        let store = SkillStore::open(dir.path()).unwrap();
        assert!(store.is_empty());
    }
}
