fn main() {
    snowmapper::cli::merge_main();
}
