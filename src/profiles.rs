use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::{ContinueEntry, upsert_entry};
use crate::store::{ACTIVE_PROFILE_KEY, KvStore, PROFILES_KEY, StoreError, USER_PROFILE_KEY};

pub const PROFILE_CONTINUE_LIMIT: usize = 20;
pub const PRONOUNS: &[&str] = &["", "-kun", "-chan", "-san", "-sama", "-senpai"];

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("no profile with id {0}")]
    UnknownProfile(String),
    #[error("incorrect password")]
    WrongPassword,
    #[error("profile name cannot be empty")]
    EmptyName,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Background {
    Color(String),
    Gradient(String),
    Image(String),
}

impl Default for Background {
    fn default() -> Self {
        Background::Color(String::from("#e50914"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Avatar {
    #[serde(default)]
    pub background: Background,
    #[serde(default)]
    pub character: Option<String>,
    #[serde(default)]
    pub frame: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub pronoun: String,
    #[serde(default)]
    pub avatar: Avatar,
    /// Plaintext gate compared verbatim on activation.
    #[serde(default)]
    pub password: Option<String>,
    pub created_at: i64,
    #[serde(default)]
    pub continue_watching: Vec<ContinueEntry>,
}

impl Profile {
    pub fn display_name(&self) -> String {
        format!("{}{}", self.name, self.pronoun)
    }

    pub fn is_locked(&self) -> bool {
        self.password.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewProfile {
    pub name: String,
    pub pronoun: String,
    pub avatar: Avatar,
    pub password: Option<String>,
}

/// Fields left as `None` keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct ProfilePatch {
    pub name: Option<String>,
    pub pronoun: Option<String>,
    pub avatar: Option<Avatar>,
    pub password: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartupState {
    NoProfiles,
    AutoActivated(Profile),
    SelectionRequired(Vec<Profile>),
    Active(Profile),
}

/// Pre-profiles single identity stored under `userProfile`.
#[derive(Debug, Deserialize)]
struct LegacyProfile {
    name: String,
    #[serde(default)]
    pronoun: String,
    #[serde(default)]
    avatar: Avatar,
}

#[derive(Clone)]
pub struct ProfileManager {
    store: KvStore,
}

impl ProfileManager {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    pub fn list_profiles(&self) -> Vec<Profile> {
        self.store.read_or_default(PROFILES_KEY)
    }

    pub fn get_profile(&self, id: &str) -> Option<Profile> {
        self.list_profiles().into_iter().find(|p| p.id == id)
    }

    fn save_profiles(&self, profiles: &[Profile]) -> Result<(), StoreError> {
        self.store.write(PROFILES_KEY, profiles)
    }

    pub fn active_profile_id(&self) -> Option<String> {
        self.store.read(ACTIVE_PROFILE_KEY, None)
    }

    pub fn active_profile(&self) -> Option<Profile> {
        self.active_profile_id().and_then(|id| self.get_profile(&id))
    }

    pub fn create_profile(&self, data: NewProfile) -> Result<Profile, ProfileError> {
        let name = data.name.trim();
        if name.is_empty() {
            return Err(ProfileError::EmptyName);
        }
        let mut profiles = self.list_profiles();
        let created_at = Utc::now().timestamp_millis();
        let mut stamp = created_at;
        while profiles.iter().any(|p| p.id == stamp.to_string()) {
            stamp += 1;
        }
        let profile = Profile {
            id: stamp.to_string(),
            name: name.to_string(),
            pronoun: data.pronoun,
            avatar: data.avatar,
            password: data.password.filter(|p| !p.is_empty()),
            created_at,
            continue_watching: Vec::new(),
        };
        profiles.push(profile.clone());
        self.save_profiles(&profiles)?;
        tracing::info!(id = %profile.id, "profile created");
        Ok(profile)
    }

    /// Unknown ids leave the active pointer untouched and yield `None`.
    pub fn set_active_profile(&self, id: &str) -> Result<Option<Profile>, StoreError> {
        let Some(profile) = self.get_profile(id) else {
            return Ok(None);
        };
        self.store.write(ACTIVE_PROFILE_KEY, &Some(&profile.id))?;
        Ok(Some(profile))
    }

    pub fn activate_with_password(
        &self,
        id: &str,
        attempt: Option<&str>,
    ) -> Result<Profile, ProfileError> {
        let profile = self
            .get_profile(id)
            .ok_or_else(|| ProfileError::UnknownProfile(id.to_string()))?;
        if let Some(expected) = &profile.password
            && attempt != Some(expected.as_str())
        {
            tracing::warn!(id, "profile activation rejected");
            return Err(ProfileError::WrongPassword);
        }
        self.set_active_profile(id)?
            .ok_or_else(|| ProfileError::UnknownProfile(id.to_string()))
    }

    pub fn clear_active_profile(&self) -> Result<(), StoreError> {
        self.store.remove(ACTIVE_PROFILE_KEY)
    }

    pub fn update_profile(
        &self,
        id: &str,
        patch: ProfilePatch,
    ) -> Result<Option<Profile>, ProfileError> {
        let name = match patch.name.as_deref().map(str::trim) {
            Some("") => return Err(ProfileError::EmptyName),
            name => name.map(str::to_string),
        };
        let mut profiles = self.list_profiles();
        let Some(profile) = profiles.iter_mut().find(|p| p.id == id) else {
            return Ok(None);
        };
        if let Some(name) = name {
            profile.name = name;
        }
        if let Some(pronoun) = patch.pronoun {
            profile.pronoun = pronoun;
        }
        if let Some(avatar) = patch.avatar {
            profile.avatar = avatar;
        }
        if let Some(password) = patch.password {
            profile.password = password.filter(|p| !p.is_empty());
        }
        let updated = profile.clone();
        self.save_profiles(&profiles)?;
        Ok(Some(updated))
    }

    /// Returns whether a profile was removed. Deleting the active profile
    /// clears the pointer without promoting another one.
    pub fn delete_profile(&self, id: &str) -> Result<bool, StoreError> {
        let mut profiles = self.list_profiles();
        let before = profiles.len();
        profiles.retain(|p| p.id != id);
        if profiles.len() == before {
            return Ok(false);
        }
        self.save_profiles(&profiles)?;
        if self.active_profile_id().as_deref() == Some(id) {
            self.clear_active_profile()?;
        }
        tracing::info!(id, "profile deleted");
        Ok(true)
    }

    pub fn update_continue_watching(
        &self,
        profile_id: &str,
        entry: ContinueEntry,
    ) -> Result<Option<Profile>, StoreError> {
        let mut profiles = self.list_profiles();
        let Some(profile) = profiles.iter_mut().find(|p| p.id == profile_id) else {
            return Ok(None);
        };
        upsert_entry(&mut profile.continue_watching, entry, PROFILE_CONTINUE_LIMIT);
        let updated = profile.clone();
        self.save_profiles(&profiles)?;
        Ok(Some(updated))
    }

    /// Resolve which profile drives the session. A lone profile without a
    /// password is activated automatically.
    pub fn startup_state(&self) -> Result<StartupState, ProfileError> {
        self.migrate_legacy_profile()?;
        let profiles = self.list_profiles();
        if let Some(active) = self.active_profile() {
            return Ok(StartupState::Active(active));
        }
        if profiles.is_empty() {
            return Ok(StartupState::NoProfiles);
        }
        if profiles.len() == 1 && !profiles[0].is_locked() {
            let id = profiles[0].id.clone();
            let profile = self
                .set_active_profile(&id)?
                .ok_or(ProfileError::UnknownProfile(id))?;
            return Ok(StartupState::AutoActivated(profile));
        }
        Ok(StartupState::SelectionRequired(profiles))
    }

    fn migrate_legacy_profile(&self) -> Result<(), ProfileError> {
        if !self.list_profiles().is_empty() {
            return Ok(());
        }
        let legacy: Option<LegacyProfile> = self.store.read(USER_PROFILE_KEY, None);
        let Some(legacy) = legacy else {
            return Ok(());
        };
        let profile = self.create_profile(NewProfile {
            name: legacy.name,
            pronoun: legacy.pronoun,
            avatar: legacy.avatar,
            password: None,
        })?;
        self.store.remove(USER_PROFILE_KEY)?;
        tracing::info!(id = %profile.id, "migrated legacy single profile");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ProfileManager {
        ProfileManager::new(KvStore::in_memory())
    }

    fn named(name: &str) -> NewProfile {
        NewProfile {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn entry(anime_id: &str) -> ContinueEntry {
        ContinueEntry {
            anime_id: anime_id.to_string(),
            title: String::new(),
            thumbnail: None,
            season: 1,
            episode: 2,
            progress: 40.0,
            updated_at: 0,
        }
    }

    #[test]
    fn create_assigns_unique_ids_without_activating() {
        let profiles = manager();
        let a = profiles.create_profile(named("A")).unwrap();
        let b = profiles.create_profile(named("B")).unwrap();
        assert_ne!(a.id, b.id);
        assert!(profiles.active_profile().is_none());
        assert_eq!(profiles.list_profiles().len(), 2);
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(matches!(
            manager().create_profile(named("   ")),
            Err(ProfileError::EmptyName)
        ));
    }

    #[test]
    fn set_active_succeeds_only_for_known_ids() {
        let profiles = manager();
        let a = profiles.create_profile(named("A")).unwrap();
        assert!(profiles.set_active_profile(&a.id).unwrap().is_some());

        assert!(profiles.set_active_profile("missing").unwrap().is_none());
        assert_eq!(profiles.active_profile_id(), Some(a.id));
    }

    #[test]
    fn update_merges_only_given_fields() {
        let profiles = manager();
        let created = profiles
            .create_profile(NewProfile {
                name: "Rin".into(),
                pronoun: "-chan".into(),
                ..Default::default()
            })
            .unwrap();
        let updated = profiles
            .update_profile(
                &created.id,
                ProfilePatch {
                    name: Some("Rin T".into()),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "Rin T");
        assert_eq!(updated.pronoun, "-chan");
        assert!(profiles
            .update_profile("missing", ProfilePatch::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn update_rejects_blank_name() {
        let profiles = manager();
        let created = profiles.create_profile(named("Rin")).unwrap();
        assert!(matches!(
            profiles.update_profile(
                &created.id,
                ProfilePatch {
                    name: Some("   ".into()),
                    ..Default::default()
                },
            ),
            Err(ProfileError::EmptyName)
        ));
        let renamed = profiles
            .update_profile(
                &created.id,
                ProfilePatch {
                    name: Some("  Rin T ".into()),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(renamed.name, "Rin T");
        assert_eq!(profiles.get_profile(&created.id).unwrap().name, "Rin T");
    }

    #[test]
    fn deleting_active_profile_clears_pointer() {
        let profiles = manager();
        let a = profiles.create_profile(named("A")).unwrap();
        let b = profiles.create_profile(named("B")).unwrap();
        profiles.set_active_profile(&a.id).unwrap();

        assert!(profiles.delete_profile(&a.id).unwrap());
        assert!(profiles.active_profile_id().is_none());
        assert_eq!(profiles.list_profiles(), vec![b]);
        assert!(!profiles.delete_profile(&a.id).unwrap());
    }

    #[test]
    fn continue_watching_is_bounded_and_unique() {
        let profiles = manager();
        let p = profiles.create_profile(named("A")).unwrap();
        for i in 0..25 {
            profiles
                .update_continue_watching(&p.id, entry(&format!("anime-{i}")))
                .unwrap();
        }
        profiles
            .update_continue_watching(&p.id, entry("anime-24"))
            .unwrap();
        profiles
            .update_continue_watching(&p.id, entry("anime-10"))
            .unwrap();

        let history = profiles.get_profile(&p.id).unwrap().continue_watching;
        assert_eq!(history.len(), PROFILE_CONTINUE_LIMIT);
        assert_eq!(history[0].anime_id, "anime-10");
        let mut ids: Vec<&str> = history.iter().map(|e| e.anime_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), PROFILE_CONTINUE_LIMIT);
    }

    #[test]
    fn password_gate_requires_exact_match() {
        let profiles = manager();
        let locked = profiles
            .create_profile(NewProfile {
                name: "Kid".into(),
                password: Some("1234".into()),
                ..Default::default()
            })
            .unwrap();

        assert!(matches!(
            profiles.activate_with_password(&locked.id, Some("123")),
            Err(ProfileError::WrongPassword)
        ));
        assert!(matches!(
            profiles.activate_with_password(&locked.id, None),
            Err(ProfileError::WrongPassword)
        ));
        assert!(profiles.active_profile_id().is_none());

        let active = profiles
            .activate_with_password(&locked.id, Some("1234"))
            .unwrap();
        assert_eq!(active.id, locked.id);
    }

    #[test]
    fn profile_round_trips_through_a_new_handle() {
        let dir = tempfile::tempdir().unwrap();
        let first = ProfileManager::new(KvStore::open(dir.path()));
        let avatar = Avatar {
            background: Background::Gradient("linear-gradient(#000, #fff)".into()),
            character: Some("chars/kon.png".into()),
            frame: Some("gold".into()),
        };
        let created = first
            .create_profile(NewProfile {
                name: "Test".into(),
                pronoun: "-kun".into(),
                avatar: avatar.clone(),
                password: None,
            })
            .unwrap();
        first
            .update_continue_watching(&created.id, entry("frieren"))
            .unwrap();

        let reopened = ProfileManager::new(KvStore::open(dir.path()));
        let loaded = reopened.get_profile(&created.id).unwrap();
        assert_eq!(loaded.name, "Test");
        assert_eq!(loaded.pronoun, "-kun");
        assert_eq!(loaded.avatar, avatar);
        assert_eq!(loaded.continue_watching, vec![entry("frieren")]);
        assert_eq!(loaded.display_name(), "Test-kun");
    }

    #[test]
    fn startup_walks_the_profile_states() {
        let profiles = manager();
        assert_eq!(profiles.startup_state().unwrap(), StartupState::NoProfiles);

        let only = profiles.create_profile(named("Solo")).unwrap();
        assert_eq!(
            profiles.startup_state().unwrap(),
            StartupState::AutoActivated(only.clone())
        );
        assert_eq!(
            profiles.startup_state().unwrap(),
            StartupState::Active(only.clone())
        );

        profiles.create_profile(named("Duo")).unwrap();
        profiles.clear_active_profile().unwrap();
        assert!(matches!(
            profiles.startup_state().unwrap(),
            StartupState::SelectionRequired(list) if list.len() == 2
        ));
    }

    #[test]
    fn legacy_user_profile_is_migrated() {
        let store = KvStore::in_memory();
        store
            .write(
                USER_PROFILE_KEY,
                &serde_json::json!({"name": "Old", "pronoun": "-san"}),
            )
            .unwrap();
        let profiles = ProfileManager::new(store.clone());
        match profiles.startup_state().unwrap() {
            StartupState::AutoActivated(p) => assert_eq!(p.display_name(), "Old-san"),
            other => panic!("unexpected state {other:?}"),
        }
        let legacy: Option<serde_json::Value> = store.read(USER_PROFILE_KEY, None);
        assert!(legacy.is_none());
    }
}
