fn main() {
    corpvpn_lib::run()
}
