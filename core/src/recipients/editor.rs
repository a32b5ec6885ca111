use chat_api::{BroadcastFilter, CityOption, Dimension, FilterOptions, RecipientClass};

/// Mutable broadcast filter bound to the available option values.
///
/// City selections only make sense inside selected regions: any change to the
/// region selection prunes cities whose region is no longer selected.
/// Selecting a city never selects its region.
#[derive(Debug, Clone, Default)]
pub struct FilterEditor {
    filter: BroadcastFilter,
    options: FilterOptions,
}

impl FilterEditor {
    pub fn new(options: FilterOptions) -> Self {
        Self {
            filter: BroadcastFilter::default(),
            options,
        }
    }

    pub fn filter(&self) -> &BroadcastFilter {
        &self.filter
    }

    pub fn options(&self) -> &FilterOptions {
        &self.options
    }

    pub fn set_recipient_class(&mut self, class: Option<RecipientClass>) {
        self.filter.recipient_class = class;
    }

    /// Flip one value of a dimension. Returns whether it is now selected.
    pub fn toggle(&mut self, dim: Dimension, id: &str) -> bool {
        let selection = self.filter.selection_mut(dim);
        let selected = if selection.remove(id) {
            false
        } else {
            selection.insert(id.to_string());
            true
        };
        if dim == Dimension::Region {
            self.prune_cities();
        }
        selected
    }

    pub fn toggle_region(&mut self, id: &str) -> bool {
        self.toggle(Dimension::Region, id)
    }

    pub fn toggle_city(&mut self, id: &str) -> bool {
        self.toggle(Dimension::City, id)
    }

    pub fn clear(&mut self, dim: Dimension) {
        self.filter.selection_mut(dim).clear();
        if dim == Dimension::Region {
            self.prune_cities();
        }
    }

    /// Cities offered for selection: those inside the selected regions.
    pub fn available_cities(&self) -> Vec<&CityOption> {
        self.options.cities_in(&self.filter.regions).collect()
    }

    fn prune_cities(&mut self) {
        let regions = &self.filter.regions;
        let options = &self.options;
        self.filter
            .cities
            .retain(|city| options.region_of(city).map_or(false, |r| regions.contains(r)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_api::FilterOption;

    fn options() -> FilterOptions {
        let opt = |id: &str| FilterOption {
            id: id.into(),
            name: id.to_uppercase(),
        };
        let city = |id: &str, region: &str| CityOption {
            id: id.into(),
            name: id.to_uppercase(),
            region_id: region.into(),
        };
        FilterOptions {
            regions: vec![opt("north"), opt("south")],
            cities: vec![
                city("n1", "north"),
                city("n2", "north"),
                city("s1", "south"),
            ],
            grades: vec![opt("5"), opt("6")],
            ..Default::default()
        }
    }

    #[test]
    fn deselecting_region_prunes_its_cities_only() {
        let mut editor = FilterEditor::new(options());
        editor.toggle_region("north");
        editor.toggle_region("south");
        editor.toggle_city("n1");
        editor.toggle_city("n2");
        editor.toggle_city("s1");
        assert!(!editor.toggle_region("south"));
        let cities: Vec<_> = editor.filter().cities.iter().cloned().collect();
        assert_eq!(cities, ["n1", "n2"]);
    }

    #[test]
    fn clearing_regions_prunes_all_cities() {
        let mut editor = FilterEditor::new(options());
        editor.toggle_region("north");
        editor.toggle_city("n1");
        editor.clear(Dimension::Region);
        assert!(editor.filter().cities.is_empty());
    }

    #[test]
    fn selecting_city_does_not_select_region() {
        let mut editor = FilterEditor::new(options());
        editor.toggle_city("s1");
        assert!(editor.filter().regions.is_empty());
        assert!(editor.filter().is_selected(Dimension::City, "s1"));
    }

    #[test]
    fn other_dimensions_toggle_independently() {
        let mut editor = FilterEditor::new(options());
        editor.toggle_region("north");
        editor.toggle_city("n2");
        assert!(editor.toggle(Dimension::Grade, "5"));
        assert!(!editor.toggle(Dimension::Grade, "5"));
        assert!(editor.filter().grades.is_empty());
        assert!(editor.filter().is_selected(Dimension::City, "n2"));
    }

    #[test]
    fn available_cities_follow_regions() {
        let mut editor = FilterEditor::new(options());
        assert!(editor.available_cities().is_empty());
        editor.toggle_region("south");
        let ids: Vec<_> = editor.available_cities().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["s1"]);
    }
}
