use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// The two mutually exclusive audiences a broadcast can target.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipientClass {
    Student,
    Teacher,
}

/// Selectable filter dimensions besides the recipient class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    Grade,
    Region,
    City,
    School,
    Branch,
    Language,
    Schedule,
}

/// Composable recipient filter. An empty selection for a dimension places no
/// restriction on it.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct BroadcastFilter {
    #[serde(default)]
    pub recipient_class: Option<RecipientClass>,
    #[serde(default)]
    pub grades: BTreeSet<String>,
    #[serde(default)]
    pub regions: BTreeSet<String>,
    #[serde(default)]
    pub cities: BTreeSet<String>,
    #[serde(default)]
    pub schools: BTreeSet<String>,
    #[serde(default)]
    pub branches: BTreeSet<String>,
    #[serde(default)]
    pub languages: BTreeSet<String>,
    #[serde(default)]
    pub schedules: BTreeSet<String>,
}

impl BroadcastFilter {
    pub fn for_class(class: RecipientClass) -> Self {
        Self {
            recipient_class: Some(class),
            ..Default::default()
        }
    }

    pub fn selection(&self, dim: Dimension) -> &BTreeSet<String> {
        match dim {
            Dimension::Grade => &self.grades,
            Dimension::Region => &self.regions,
            Dimension::City => &self.cities,
            Dimension::School => &self.schools,
            Dimension::Branch => &self.branches,
            Dimension::Language => &self.languages,
            Dimension::Schedule => &self.schedules,
        }
    }

    pub fn selection_mut(&mut self, dim: Dimension) -> &mut BTreeSet<String> {
        match dim {
            Dimension::Grade => &mut self.grades,
            Dimension::Region => &mut self.regions,
            Dimension::City => &mut self.cities,
            Dimension::School => &mut self.schools,
            Dimension::Branch => &mut self.branches,
            Dimension::Language => &mut self.languages,
            Dimension::Schedule => &mut self.schedules,
        }
    }

    pub fn is_selected(&self, dim: Dimension, id: &str) -> bool {
        self.selection(dim).contains(id)
    }

    /// Whether `recipient` falls inside this filter. Without a recipient
    /// class nobody matches.
    pub fn matches(&self, recipient: &RecipientProfile) -> bool {
        let Some(class) = self.recipient_class else {
            return false;
        };
        class == recipient.class
            && selected(&self.grades, recipient.grade.as_deref())
            && selected(&self.regions, recipient.region.as_deref())
            && selected(&self.cities, recipient.city.as_deref())
            && selected(&self.schools, recipient.school.as_deref())
            && selected(&self.branches, recipient.branch.as_deref())
            && selected(&self.languages, recipient.language.as_deref())
            && selected(&self.schedules, recipient.schedule.as_deref())
    }
}

fn selected(set: &BTreeSet<String>, value: Option<&str>) -> bool {
    set.is_empty() || value.map_or(false, |v| set.contains(v))
}

/// Attributes of a potential broadcast recipient.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RecipientProfile {
    pub id: String,
    pub class: RecipientClass,
    #[serde(default)]
    pub grade: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub school: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub schedule: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FilterOption {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CityOption {
    pub id: String,
    pub name: String,
    pub region_id: String,
}

/// Values available for each filter dimension.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct FilterOptions {
    #[serde(default)]
    pub grades: Vec<FilterOption>,
    #[serde(default)]
    pub regions: Vec<FilterOption>,
    #[serde(default)]
    pub cities: Vec<CityOption>,
    #[serde(default)]
    pub schools: Vec<FilterOption>,
    #[serde(default)]
    pub branches: Vec<FilterOption>,
    #[serde(default)]
    pub languages: Vec<FilterOption>,
    #[serde(default)]
    pub schedules: Vec<FilterOption>,
}

impl FilterOptions {
    /// Parent region of a city, if the city is known.
    pub fn region_of(&self, city_id: &str) -> Option<&str> {
        self.cities
            .iter()
            .find(|c| c.id == city_id)
            .map(|c| c.region_id.as_str())
    }

    /// Cities belonging to any of the given regions.
    pub fn cities_in<'a>(
        &'a self,
        regions: &'a BTreeSet<String>,
    ) -> impl Iterator<Item = &'a CityOption> + 'a {
        self.cities
            .iter()
            .filter(move |c| regions.contains(&c.region_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(region: &str, city: &str, grade: &str) -> RecipientProfile {
        RecipientProfile {
            id: format!("{region}-{city}-{grade}"),
            class: RecipientClass::Student,
            grade: Some(grade.into()),
            region: Some(region.into()),
            city: Some(city.into()),
            school: None,
            branch: None,
            language: None,
            schedule: None,
        }
    }

    #[test]
    fn empty_dimension_is_unrestricted() {
        let filter = BroadcastFilter::for_class(RecipientClass::Student);
        assert!(filter.matches(&student("r1", "c1", "5")));
    }

    #[test]
    fn no_class_matches_nobody() {
        let filter = BroadcastFilter::default();
        assert!(!filter.matches(&student("r1", "c1", "5")));
    }

    #[test]
    fn selected_dimensions_intersect() {
        let mut filter = BroadcastFilter::for_class(RecipientClass::Student);
        filter.regions.insert("r1".into());
        filter.grades.insert("5".into());
        assert!(filter.matches(&student("r1", "c1", "5")));
        assert!(!filter.matches(&student("r2", "c9", "5")));
        assert!(!filter.matches(&student("r1", "c1", "6")));
    }

    #[test]
    fn missing_attribute_fails_a_restricted_dimension() {
        let mut filter = BroadcastFilter::for_class(RecipientClass::Student);
        filter.schools.insert("s1".into());
        assert!(!filter.matches(&student("r1", "c1", "5")));
    }

    #[test]
    fn class_must_match() {
        let filter = BroadcastFilter::for_class(RecipientClass::Teacher);
        assert!(!filter.matches(&student("r1", "c1", "5")));
    }

    #[test]
    fn region_lookup() {
        let options = FilterOptions {
            cities: vec![CityOption {
                id: "c1".into(),
                name: "Harbor".into(),
                region_id: "r1".into(),
            }],
            ..Default::default()
        };
        assert_eq!(options.region_of("c1"), Some("r1"));
        assert_eq!(options.region_of("c2"), None);
    }
}
