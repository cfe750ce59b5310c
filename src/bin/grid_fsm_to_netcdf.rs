fn main() {
    snowmapper::cli::grid_main();
}
