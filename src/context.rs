//! Application context - explicit state passed to whoever needs it

use crate::config::Config;
use crate::error::Result;
use crate::storage::{Credentials, KeyValueStore};
use std::collections::BTreeSet;

/// Candidate profile sections counted towards completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProfileSection {
    AboutMe,
    Education,
    WorkExperience,
    Skill,
    ForeignLanguage,
    Award,
    Certificate,
    HighlightProject,
}

impl ProfileSection {
    pub const ALL: [ProfileSection; 8] = [
        ProfileSection::AboutMe,
        ProfileSection::Education,
        ProfileSection::WorkExperience,
        ProfileSection::Skill,
        ProfileSection::ForeignLanguage,
        ProfileSection::Award,
        ProfileSection::Certificate,
        ProfileSection::HighlightProject,
    ];

    /// REST resource name of the section
    pub fn resource(&self) -> &'static str {
        match self {
            ProfileSection::AboutMe => "AboutMe",
            ProfileSection::Education => "Education",
            ProfileSection::WorkExperience => "WorkExperience",
            ProfileSection::Skill => "Skill",
            ProfileSection::ForeignLanguage => "ForeignLanguage",
            ProfileSection::Award => "Award",
            ProfileSection::Certificate => "Certificate",
            ProfileSection::HighlightProject => "HighlightProject",
        }
    }
}

/// Which profile sections have content
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileCompletion {
    filled: BTreeSet<ProfileSection>,
}

impl ProfileCompletion {
    pub fn mark(&mut self, section: ProfileSection, has_content: bool) {
        if has_content {
            self.filled.insert(section);
        } else {
            self.filled.remove(&section);
        }
    }

    pub fn is_filled(&self, section: ProfileSection) -> bool {
        self.filled.contains(&section)
    }

    /// Whole percent, rounded down
    pub fn percent(&self) -> u8 {
        (self.filled.len() * 100 / ProfileSection::ALL.len()) as u8
    }

    pub fn missing(&self) -> Vec<ProfileSection> {
        ProfileSection::ALL
            .iter()
            .copied()
            .filter(|s| !self.is_filled(*s))
            .collect()
    }
}

/// Everything a screen or command needs, owned in one place
pub struct AppContext {
    pub config: Config,
    pub store: KeyValueStore,
    pub profile: ProfileCompletion,
}

impl AppContext {
    pub fn open(config: Config) -> Result<Self> {
        let store = KeyValueStore::open(&config)?;
        Ok(Self {
            config,
            store,
            profile: ProfileCompletion::default(),
        })
    }

    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::load(&self.store)
    }

    /// Forget credentials and per-user state
    pub fn logout(&mut self) -> Result<()> {
        self.profile = ProfileCompletion::default();
        Credentials::clear(&mut self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_profile_percent() {
        let mut profile = ProfileCompletion::default();
        assert_eq!(profile.percent(), 0);
        profile.mark(ProfileSection::AboutMe, true);
        profile.mark(ProfileSection::Education, true);
        assert_eq!(profile.percent(), 25);
        profile.mark(ProfileSection::Education, false);
        assert_eq!(profile.percent(), 12);
        for section in ProfileSection::ALL {
            profile.mark(section, true);
        }
        assert_eq!(profile.percent(), 100);
        assert!(profile.missing().is_empty());
    }

    #[test]
    fn test_missing_sections_in_order() {
        let mut profile = ProfileCompletion::default();
        profile.mark(ProfileSection::Skill, true);
        let missing = profile.missing();
        assert_eq!(missing.len(), 7);
        assert_eq!(missing[0], ProfileSection::AboutMe);
        assert!(!missing.contains(&ProfileSection::Skill));
    }

    #[test]
    fn test_logout_clears_state() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = AppContext::open(Config::for_test(temp_dir.path())).unwrap();
        Credentials {
            token: "t".to_string(),
            user_id: "1".to_string(),
            role: None,
            user: None,
        }
        .save(&mut ctx.store)
        .unwrap();
        ctx.profile.mark(ProfileSection::Award, true);
        assert!(ctx.credentials().is_some());

        ctx.logout().unwrap();
        assert!(ctx.credentials().is_none());
        assert_eq!(ctx.profile.percent(), 0);
    }
}
