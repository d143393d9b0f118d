const COMMANDS: &[&str] = &[
    "organizer_open",
    "organizer_pages",
    "organizer_insert_files",
    "organizer_insert_blank",
    "organizer_remove",
    "organizer_move",
    "organizer_sort",
    "organizer_reset",
    "organizer_clear",
    "organizer_render",
    "organizer_thumbnail",
    "organizer_save",
    "organizer_close",
    "split_open",
    "split_preview",
    "split_execute",
    "split_close",
];

fn main() {
    // Permission manifests are only generated for the Tauri plugin build.
    #[cfg(feature = "desktop")]
    tauri_plugin::Builder::new(COMMANDS).build();
    #[cfg(not(feature = "desktop"))]
    let _ = COMMANDS;
}
