/// A marker trait for component settings. Use this to define the settings for a component.
/// These settings should be readable from a config file.
pub trait ComponentSettings: Clone {}

/// A trait for components of the training pipeline that can be built directly from their
/// settings. Components whose construction can fail validate their settings separately and
/// return a <code>TrainError</code> instead.
pub trait Component {
    type Settings: ComponentSettings;

    fn with_settings(settings: &Self::Settings) -> Self;
}
